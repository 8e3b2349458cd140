// crates/lochness-connectors/src/sources/xnat.rs
// ============================================================================
// Module: XNAT Source
// Description: Experiment listing and retrieval from an XNAT project.
// Purpose: Emit one change item per modified imaging experiment.
// Dependencies: lochness-core, reqwest, serde
// ============================================================================

//! ## Overview
//! The project experiment listing carries `last_modified` for every
//! experiment. Experiments modified after the checkpoint are fetched one at
//! a time, either as experiment JSON or, when `include_archive` is set, as
//! the zipped file archive of all scans. Timestamps are kept to the whole
//! second, and experiments stamped in the server's current second wait for
//! the next listing.
//!
//! Credentials use HTTP basic auth: `username`/`password`, or an
//! `api_token` sent as both user and password (XNAT alias tokens).

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
use lochness_core::SubjectId;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use reqwest::Client;
use reqwest::RequestBuilder;
use serde::Deserialize;
use tracing::debug;

use crate::http::HttpOptions;
use crate::http::build_client;
use crate::http::endpoint;
use crate::http::read_bytes;
use crate::http::read_json;
use crate::http::send;
use crate::http::server_time;
use crate::registry::SourceFactory;
use crate::sources::descriptor_named;
use crate::sources::order_after;
use crate::sources::settled_before;
use crate::sources::wrong_metadata;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Granularity of listed experiment timestamps (ms).
const LISTING_CLOCK_UNIT_MS: i64 = 1_000;

// ============================================================================
// SECTION: Wire Types
// ============================================================================

/// Experiment listing envelope.
#[derive(Debug, Deserialize)]
struct Listing {
    /// Result set wrapper.
    #[serde(rename = "ResultSet")]
    result_set: ResultSet,
}

/// Listing rows.
#[derive(Debug, Deserialize)]
struct ResultSet {
    /// One row per experiment.
    #[serde(rename = "Result", default)]
    result: Vec<ExperimentRow>,
}

/// One experiment row.
#[derive(Debug, Deserialize)]
struct ExperimentRow {
    /// Accession id (`XNAT_E00001`), stable across relabels.
    #[serde(rename = "ID")]
    id: String,
    /// Subject label.
    #[serde(default)]
    subject_label: Option<String>,
    /// Creation time.
    #[serde(default)]
    insert_date: Option<String>,
    /// Last modification time; empty for never-modified experiments.
    #[serde(default)]
    last_modified: Option<String>,
}

impl ExperimentRow {
    /// Returns the modification time, falling back to the insert time.
    fn changed_at(&self) -> Result<Timestamp, ConnectorError> {
        let raw = [&self.last_modified, &self.insert_date]
            .into_iter()
            .flatten()
            .map(|value| value.trim())
            .find(|value| !value.is_empty())
            .ok_or_else(|| {
                ConnectorError::Malformed(format!("xnat experiment {} has no timestamp", self.id))
            })?;
        let whole_seconds = raw.split_once('.').map_or(raw, |(seconds, _)| seconds);
        Timestamp::parse_naive_utc(whole_seconds)
            .map_err(|err| ConnectorError::Malformed(format!("xnat experiment {}: {err}", self.id)))
    }
}

/// Listed experiment awaiting retrieval.
#[derive(Debug, Clone)]
struct Experiment {
    /// Modification time.
    produced_at: Timestamp,
    /// Accession id.
    id: ExternalId,
    /// Subject label, if reported.
    subject: Option<SubjectId>,
}

// ============================================================================
// SECTION: Auth
// ============================================================================

/// Attaches basic auth from the credential.
fn authorize(request: RequestBuilder, credential: &Secret) -> Result<RequestBuilder, ConnectorError> {
    if let Some(token) = credential.optional_field("api_token")? {
        return Ok(request.basic_auth(token.as_str(), Some(token.as_str())));
    }
    let username = credential.field("username")?;
    let password = credential.field("password")?;
    Ok(request.basic_auth(username.as_str(), Some(password.as_str())))
}

// ============================================================================
// SECTION: Source
// ============================================================================

/// XNAT project source.
pub struct XnatSource {
    /// Shared HTTP client.
    client: Client,
    /// XNAT base URL.
    base_url: String,
    /// Project id.
    project: String,
    /// Fetch scan archives instead of experiment JSON.
    include_archive: bool,
    /// Response size cap.
    max_body_bytes: u64,
}

#[async_trait]
impl SourceConnector for XnatSource {
    async fn list_changes(
        &self,
        since: &Watermark,
        credential: &Secret,
    ) -> Result<Box<dyn ChangeStream>, ConnectorError> {
        let url = endpoint(&self.base_url, &["data", "projects", self.project.as_str(), "experiments"])?;
        let request = self.client.get(url).query(&[
            ("format", "json"),
            ("columns", "ID,label,subject_label,insert_date,last_modified"),
        ]);
        let response = send(authorize(request, credential)?, "xnat experiment listing").await?;
        let server_now = server_time(&response);
        let listing: Listing =
            read_json(response, self.max_body_bytes, "xnat experiment listing").await?;

        let mut rows = Vec::with_capacity(listing.result_set.result.len());
        for row in listing.result_set.result {
            let produced_at = row.changed_at()?;
            let subject = row
                .subject_label
                .as_deref()
                .map(str::trim)
                .filter(|label| !label.is_empty())
                .map(SubjectId::new);
            rows.push((produced_at, ExternalId::new(row.id), subject));
        }
        let settled = settled_before(rows, server_now, LISTING_CLOCK_UNIT_MS);
        let pending: VecDeque<Experiment> = order_after(since, settled)
            .into_iter()
            .map(|(produced_at, id, subject)| Experiment {
                produced_at,
                id,
                subject,
            })
            .collect();
        debug!(project = %self.project, experiments = pending.len(), "xnat changes listed");
        Ok(Box::new(XnatStream {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            include_archive: self.include_archive,
            max_body_bytes: self.max_body_bytes,
            pending,
        }))
    }
}

// ============================================================================
// SECTION: Stream
// ============================================================================

/// Lazy experiment fetcher.
struct XnatStream {
    /// Shared HTTP client.
    client: Client,
    /// XNAT base URL.
    base_url: String,
    /// Fetch scan archives instead of experiment JSON.
    include_archive: bool,
    /// Response size cap.
    max_body_bytes: u64,
    /// Experiments not yet produced.
    pending: VecDeque<Experiment>,
}

impl XnatStream {
    /// Downloads one experiment.
    async fn fetch(&self, experiment: &Experiment, credential: &Secret) -> Result<Payload, ConnectorError> {
        let id = experiment.id.as_str();
        let (url, format, content_type) = if self.include_archive {
            (
                endpoint(&self.base_url, &["data", "experiments", id, "scans", "ALL", "files"])?,
                "zip",
                "application/zip",
            )
        } else {
            (endpoint(&self.base_url, &["data", "experiments", id])?, "json", "application/json")
        };
        let request = self.client.get(url).query(&[("format", format)]);
        let response = send(authorize(request, credential)?, "xnat experiment fetch").await?;
        let bytes = read_bytes(response, self.max_body_bytes, "xnat experiment fetch").await?;
        Ok(Payload::new(bytes, content_type))
    }
}

#[async_trait]
impl ChangeStream for XnatStream {
    async fn next_item(
        &mut self,
        credential: &Secret,
    ) -> Result<Option<ChangeItem>, ConnectorError> {
        let Some(experiment) = self.pending.front() else {
            return Ok(None);
        };
        let payload = self.fetch(experiment, credential).await?;
        let Some(experiment) = self.pending.pop_front() else {
            return Ok(None);
        };
        Ok(Some(ChangeItem {
            external_id: experiment.id,
            payload,
            produced_at: experiment.produced_at,
            subject_id: experiment.subject,
        }))
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Factory for `xnat` sources.
pub struct XnatSourceFactory {
    /// Shared HTTP client.
    client: Client,
    /// Response size cap.
    max_body_bytes: u64,
}

impl XnatSourceFactory {
    /// Creates the factory and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] when the client cannot be built.
    pub fn new(options: &HttpOptions) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: build_client(options)?,
            max_body_bytes: options.max_body_bytes,
        })
    }
}

impl SourceFactory for XnatSourceFactory {
    fn descriptor(&self) -> DataSourceType {
        descriptor_named("xnat")
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &["username", "password"]
    }

    fn validate_credential(&self, credential: &Secret) -> Result<(), ConnectorError> {
        if credential.optional_field("api_token")?.is_some() {
            return Ok(());
        }
        credential.require_fields(self.credential_fields())?;
        Ok(())
    }

    fn build(
        &self,
        instance: &DataSourceInstance,
    ) -> Result<Box<dyn SourceConnector>, ConnectorError> {
        let SourceMetadata::Xnat(meta) = &instance.connector else {
            return Err(wrong_metadata("xnat", &instance.connector));
        };
        Ok(Box::new(XnatSource {
            client: self.client.clone(),
            base_url: meta.endpoint_url.clone(),
            project: meta.project.clone(),
            include_archive: meta.include_archive,
            max_body_bytes: self.max_body_bytes,
        }))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
