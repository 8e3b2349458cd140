// crates/lochness-connectors/src/sources/sharepoint.rs
// ============================================================================
// Module: SharePoint Source
// Description: Document library listing through Microsoft Graph.
// Purpose: Emit one change item per file modified in a SharePoint folder.
// Dependencies: lochness-core, reqwest, serde, url, zeroize
// ============================================================================

//! ## Overview
//! The source authenticates with the client-credentials grant, resolves the
//! site and the named document library, then walks the configured folder and
//! its subfolders. Every listing page (`@odata.nextLink`) is read before the
//! stream opens; a paging link that points outside the Graph base origin is
//! rejected before the bearer token is sent to it. File content is downloaded lazily from
//! `/drives/{drive}/items/{item}/content`.
//!
//! External ids are paths relative to the configured folder, so a file keeps
//! its id across content changes.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;

use async_trait::async_trait;
use lochness_core::ChangeItem;
use lochness_core::ChangeStream;
use lochness_core::ConnectorError;
use lochness_core::DataSourceInstance;
use lochness_core::DataSourceType;
use lochness_core::ExternalId;
use lochness_core::Payload;
use lochness_core::Secret;
use lochness_core::SourceConnector;
use lochness_core::SourceMetadata;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use crate::http::HttpOptions;
use crate::http::build_client;
use crate::http::endpoint;
use crate::http::read_bytes;
use crate::http::read_json;
use crate::http::send;
use crate::registry::SourceFactory;
use crate::sources::descriptor_named;
use crate::sources::order_after;
use crate::sources::wrong_metadata;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Deepest folder nesting walked below the configured folder.
const MAX_FOLDER_DEPTH: usize = 8;
/// Content type used when Graph reports none.
const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

// ============================================================================
// SECTION: Endpoints
// ============================================================================

/// Microsoft identity and Graph endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SharepointEndpoints {
    /// Identity platform base (`https://login.microsoftonline.com`).
    pub login_base: String,
    /// Graph API base including version.
    pub graph_base: String,
    /// OAuth scope requested for Graph.
    pub scope: String,
}

impl Default for SharepointEndpoints {
    fn default() -> Self {
        Self {
            login_base: "https://login.microsoftonline.com".to_string(),
            graph_base: "https://graph.microsoft.com/v1.0".to_string(),
            scope: "https://graph.microsoft.com/.default".to_string(),
        }
    }
}

// ============================================================================
// SECTION: Wire Types
// ============================================================================

/// Token endpoint response.
#[derive(Deserialize)]
struct TokenResponse {
    /// Bearer token.
    access_token: String,
}

/// Object with a Graph id.
#[derive(Debug, Deserialize)]
struct GraphId {
    /// Graph id.
    id: String,
}

/// Document library.
#[derive(Debug, Deserialize)]
struct Drive {
    /// Drive id.
    id: String,
    /// Display name.
    name: String,
}

/// One page of a Graph collection.
#[derive(Debug, Deserialize)]
struct Page<T> {
    /// Page entries.
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    /// Next page URL.
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// File facet.
#[derive(Debug, Deserialize)]
struct FileFacet {
    /// MIME type.
    #[serde(rename = "mimeType", default)]
    mime_type: Option<String>,
}

/// Drive item (file or folder).
#[derive(Debug, Deserialize)]
struct DriveItem {
    /// Item id.
    id: String,
    /// Item name.
    name: String,
    /// Last modification time (RFC 3339).
    #[serde(rename = "lastModifiedDateTime")]
    last_modified: String,
    /// Present for files.
    #[serde(default)]
    file: Option<FileFacet>,
    /// Present for folders.
    #[serde(default)]
    folder: Option<serde_json::Value>,
}

/// Listed file awaiting download.
#[derive(Debug, Clone)]
struct ListedFile {
    /// Graph item id.
    item_id: String,
    /// MIME type.
    content_type: String,
}

// ============================================================================
// SECTION: Graph Client
// ============================================================================

/// Graph calls shared by the source and its stream.
#[derive(Clone)]
struct Graph {
    /// Shared HTTP client.
    client: Client,
    /// Endpoints.
    endpoints: SharepointEndpoints,
    /// Response size cap.
    max_body_bytes: u64,
}

impl Graph {
    /// Acquires an app-only access token.
    async fn access_token(&self, credential: &Secret) -> Result<Zeroizing<String>, ConnectorError> {
        let tenant = credential.field("tenant_id")?;
        let client_id = credential.field("client_id")?;
        let client_secret = credential.field("client_secret")?;
        let url = endpoint(&self.endpoints.login_base, &[tenant.as_str(), "oauth2", "v2.0", "token"])?;
        let form = [
            ("client_id", client_id.as_str()),
            ("client_secret", client_secret.as_str()),
            ("scope", self.endpoints.scope.as_str()),
            ("grant_type", "client_credentials"),
        ];
        let response = send(self.client.post(url).form(&form), "sharepoint token").await?;
        let token: TokenResponse = read_json(response, self.max_body_bytes, "sharepoint token").await?;
        Ok(Zeroizing::new(token.access_token))
    }

    /// Sends an authorized GET and decodes JSON.
    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        token: &str,
        context: &str,
    ) -> Result<T, ConnectorError> {
        let response = send(self.client.get(url).bearer_auth(token), context).await?;
        read_json(response, self.max_body_bytes, context).await
    }

    /// Reads every page of a collection.
    async fn get_all<T: DeserializeOwned>(
        &self,
        first: Url,
        token: &str,
        context: &str,
    ) -> Result<Vec<T>, ConnectorError> {
        let mut entries = Vec::new();
        let mut next = Some(first);
        while let Some(url) = next.take() {
            let page: Page<T> = self.get_json(url, token, context).await?;
            entries.extend(page.value);
            next = page
                .next_link
                .map(|link| self.next_page(&link, context))
                .transpose()?;
        }
        Ok(entries)
    }

    /// Parses a paging link, refusing any origin other than the Graph base.
    fn next_page(&self, link: &str, context: &str) -> Result<Url, ConnectorError> {
        let url = Url::parse(link)
            .map_err(|err| ConnectorError::Malformed(format!("{context}: invalid next link: {err}")))?;
        let graph = Url::parse(&self.endpoints.graph_base)
            .map_err(|err| ConnectorError::Permanent(format!("invalid graph base url: {err}")))?;
        if url.origin() != graph.origin() {
            return Err(ConnectorError::Malformed(format!(
                "{context}: next link leaves the graph origin ({})",
                url.origin().ascii_serialization()
            )));
        }
        Ok(url)
    }

    /// Resolves the Graph site id for a SharePoint site URL.
    async fn site_id(&self, site_url: &str, token: &str) -> Result<String, ConnectorError> {
        let parsed = Url::parse(site_url)
            .map_err(|err| ConnectorError::Permanent(format!("invalid site url: {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| ConnectorError::Permanent("site url has no host".to_string()))?;
        let path = parsed.path().trim_end_matches('/');
        let url = if path.is_empty() {
            endpoint(&self.endpoints.graph_base, &["sites", host])?
        } else {
            let mut url = endpoint(&self.endpoints.graph_base, &["sites"])?;
            let site_path = format!("{}/{host}:{path}", url.path());
            url.set_path(&site_path);
            url
        };
        let site: GraphId = self.get_json(url, token, "sharepoint site lookup").await?;
        Ok(site.id)
    }

    /// Resolves a document library by display name, ignoring case.
    async fn drive_id(&self, site_id: &str, drive_name: &str, token: &str) -> Result<String, ConnectorError> {
        let url = endpoint(&self.endpoints.graph_base, &["sites", site_id, "drives"])?;
        let drives: Vec<Drive> = self.get_all(url, token, "sharepoint drive listing").await?;
        drives
            .into_iter()
            .find(|drive| drive.name.eq_ignore_ascii_case(drive_name))
            .map(|drive| drive.id)
            .ok_or_else(|| ConnectorError::Permanent(format!("document library {drive_name:?} not found")))
    }

    /// Lists the children of the drive root or of a folder path.
    async fn children_by_path(
        &self,
        drive_id: &str,
        folder: Option<&str>,
        token: &str,
    ) -> Result<Vec<DriveItem>, ConnectorError> {
        let parts: Vec<&str> = folder
            .map(|path| path.split('/').filter(|part| !part.is_empty()).collect())
            .unwrap_or_default();
        let url = match parts.split_last() {
            None => endpoint(&self.endpoints.graph_base, &["drives", drive_id, "root", "children"])?,
            Some((last, inner)) => {
                let last = format!("{last}:");
                let mut segments = vec!["drives", drive_id, "root:"];
                segments.extend(inner);
                segments.push(&last);
                segments.push("children");
                endpoint(&self.endpoints.graph_base, &segments)?
            }
        };
        self.get_all(url, token, "sharepoint folder listing").await
    }

    /// Lists the children of a folder item.
    async fn children_of(&self, drive_id: &str, item_id: &str, token: &str) -> Result<Vec<DriveItem>, ConnectorError> {
        let url = endpoint(&self.endpoints.graph_base, &["drives", drive_id, "items", item_id, "children"])?;
        self.get_all(url, token, "sharepoint folder listing").await
    }

    /// Downloads file content.
    async fn content(&self, drive_id: &str, item_id: &str, token: &str) -> Result<Vec<u8>, ConnectorError> {
        let url = endpoint(&self.endpoints.graph_base, &["drives", drive_id, "items", item_id, "content"])?;
        let response = send(self.client.get(url).bearer_auth(token), "sharepoint download").await?;
        read_bytes(response, self.max_body_bytes, "sharepoint download").await
    }
}

// ============================================================================
// SECTION: Source
// ============================================================================

/// SharePoint document library source.
pub struct SharepointSource {
    /// Graph client.
    graph: Graph,
    /// Site URL.
    site_url: String,
    /// Document library name.
    drive_name: String,
    /// Folder inside the library.
    folder_path: Option<String>,
}

impl SharepointSource {
    /// Walks the folder tree and returns every file with its relative path.
    async fn list_files(
        &self,
        drive_id: &str,
        token: &str,
    ) -> Result<Vec<(Timestamp, ExternalId, ListedFile)>, ConnectorError> {
        let mut files = Vec::new();
        let top = self.graph.children_by_path(drive_id, self.folder_path.as_deref(), token).await?;
        let mut folders: VecDeque<(String, usize, Vec<DriveItem>)> = VecDeque::new();
        folders.push_back((String::new(), 0, top));
        while let Some((prefix, depth, items)) = folders.pop_front() {
            for item in items {
                let relative = if prefix.is_empty() {
                    item.name.clone()
                } else {
                    format!("{prefix}/{}", item.name)
                };
                if item.folder.is_some() {
                    if depth < MAX_FOLDER_DEPTH {
                        let children = self.graph.children_of(drive_id, &item.id, token).await?;
                        folders.push_back((relative, depth + 1, children));
                    } else {
                        debug!(folder = %relative, "sharepoint folder below depth limit skipped");
                    }
                    continue;
                }
                let Some(file) = item.file else {
                    continue;
                };
                let produced_at = Timestamp::parse_rfc3339(&item.last_modified)
                    .map_err(|err| ConnectorError::Malformed(format!("sharepoint item {relative}: {err}")))?;
                files.push((
                    produced_at,
                    ExternalId::new(relative),
                    ListedFile {
                        item_id: item.id,
                        content_type: file.mime_type.unwrap_or_else(|| FALLBACK_CONTENT_TYPE.to_string()),
                    },
                ));
            }
        }
        Ok(files)
    }
}

#[async_trait]
impl SourceConnector for SharepointSource {
    async fn list_changes(
        &self,
        since: &Watermark,
        credential: &Secret,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError> {
        let token = self.graph.access_token(credential).await?;
        let site_id = self.graph.site_id(&self.site_url, &token).await?;
        let drive_id = self.graph.drive_id(&site_id, &self.drive_name, &token).await?;
        let files = self.list_files(&drive_id, &token).await?;
        let pending: VecDeque<(Timestamp, ExternalId, ListedFile)> = order_after(since, files).into();
        debug!(drive = %self.drive_name, files = pending.len(), "sharepoint changes listed");
        Ok(Box::new(SharepointStream {
            graph: self.graph.clone(),
            drive_id,
            token: Some(token),
            pending,
        }))
    }
}

// ============================================================================
// SECTION: Stream
// ============================================================================

/// Lazy file downloader.
struct SharepointStream {
    /// Graph client.
    graph: Graph,
    /// Resolved drive id.
    drive_id: String,
    /// Cached access token; dropped when Graph rejects it.
    token: Option<Zeroizing<String>>,
    /// Files not yet produced.
    pending: VecDeque<(Timestamp, ExternalId, ListedFile)>,
}

#[async_trait]
impl ChangeStream for SharepointStream {
    async fn next_item(
        &mut self,
        credential: &Secret,
    ) -> Result<Option<ChangeItem>, ConnectorError> {
        let Some((_, _, file)) = self.pending.front() else {
            return Ok(None);
        };
        let item_id = file.item_id.clone();
        let token = match self.token.take() {
            Some(token) => token,
            None => self.graph.access_token(credential).await?,
        };
        let bytes = match self.graph.content(&self.drive_id, &item_id, &token).await {
            Ok(bytes) => bytes,
            Err(err @ ConnectorError::AuthExpired(_)) => return Err(err),
            Err(err) => {
                self.token = Some(token);
                return Err(err);
            }
        };
        self.token = Some(token);
        let Some((produced_at, external_id, file)) = self.pending.pop_front() else {
            return Ok(None);
        };
        Ok(Some(ChangeItem {
            external_id,
            payload: Payload::new(bytes, file.content_type),
            produced_at,
            subject_id: None,
        }))
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Factory for `sharepoint` sources.
pub struct SharepointSourceFactory {
    /// Graph client template.
    graph: Graph,
}

impl SharepointSourceFactory {
    /// Creates the factory and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] when the client cannot be built.
    pub fn new(options: &HttpOptions, endpoints: SharepointEndpoints) -> Result<Self, ConnectorError> {
        Ok(Self {
            graph: Graph {
                client: build_client(options)?,
                endpoints,
                max_body_bytes: options.max_body_bytes,
            },
        })
    }
}

impl SourceFactory for SharepointSourceFactory {
    fn descriptor(&self) -> DataSourceType {
        descriptor_named("sharepoint")
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &["tenant_id", "client_id", "client_secret"]
    }

    fn build(
        &self,
        instance: &DataSourceInstance,
    ) -> Result<Box<dyn SourceConnector>, ConnectorError> {
        let SourceMetadata::Sharepoint(meta) = &instance.connector else {
            return Err(wrong_metadata("sharepoint", &instance.connector));
        };
        Ok(Box::new(SharepointSource {
            graph: self.graph.clone(),
            site_url: meta.site_url.clone(),
            drive_name: meta.drive_name.clone(),
            folder_path: meta.folder_path.clone(),
        }))
    }
}
