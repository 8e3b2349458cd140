// crates/lochness-connectors/tests/sharepoint_source.rs
// ============================================================================
// Module: SharePoint Source Tests
// Description: Graph listing and download against a mock identity and Graph API.
// Purpose: Pin drive resolution, paging, folder walking, and token refresh.
// Dependencies: lochness-connectors, lochness-core, tiny_http, tokio
// ============================================================================

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

mod common;

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use lochness_connectors::SharepointEndpoints;
use lochness_connectors::SharepointSourceFactory;
use lochness_connectors::SourceFactory;
use lochness_connectors::http::HttpOptions;
use lochness_core::ConnectorError;
use lochness_core::ExternalId;
use lochness_core::Secret;
use lochness_core::SharepointMetadata;
use lochness_core::SourceMetadata;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use serde_json::json;

use crate::common::MockServer;
use crate::common::Reply;
use crate::common::secret;
use crate::common::source_instance;

// ============================================================================
// SECTION: Helpers
// ============================================================================

struct GraphState {
    tokens_issued: AtomicUsize,
    reject_next_download: AtomicBool,
    /// Base the first page's next link points at; the server itself when unset.
    paging_base: Option<String>,
}

fn graph_server(state: Arc<GraphState>) -> MockServer {
    MockServer::start(move |request| {
        let path = request.path();
        if path == "/login/tenant-1/oauth2/v2.0/token" {
            let form = request.form();
            assert_eq!(form.get("grant_type").map(String::as_str), Some("client_credentials"));
            let issued = state.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
            return Reply::json(&json!({"access_token": format!("tok-{issued}"), "token_type": "Bearer"}));
        }
        if request.header("authorization").is_none_or(|value| !value.starts_with("Bearer tok-")) {
            return Reply::status(401);
        }
        let paging_base = state
            .paging_base
            .clone()
            .unwrap_or_else(|| format!("http://{}", request.header("host").unwrap_or_default()));
        match path {
            "/graph/v1.0/sites/contoso.sharepoint.com:/sites/Study" => Reply::json(&json!({"id": "site-1"})),
            "/graph/v1.0/sites/site-1/drives" => Reply::json(&json!({
                "value": [{"id": "drive-a", "name": "Documents"}, {"id": "drive-b", "name": "Team Forms"}]
            })),
            "/graph/v1.0/drives/drive-b/root:/Uploads:/children" => Reply::json(&json!({
                "value": [
                    {"id": "item-a", "name": "a.json", "lastModifiedDateTime": "2024-05-02T10:00:00Z",
                     "file": {"mimeType": "application/json"}},
                    {"id": "folder-1", "name": "sub", "lastModifiedDateTime": "2024-05-04T10:00:00Z",
                     "folder": {"childCount": 1}}
                ],
                "@odata.nextLink": format!("{paging_base}/graph/v1.0/paging/uploads-2")
            })),
            "/graph/v1.0/paging/uploads-2" => Reply::json(&json!({
                "value": [
                    {"id": "item-b", "name": "b.csv", "lastModifiedDateTime": "2024-05-01T10:00:00Z",
                     "file": {"mimeType": "text/csv"}}
                ]
            })),
            "/graph/v1.0/drives/drive-b/items/folder-1/children" => Reply::json(&json!({
                "value": [
                    {"id": "item-c", "name": "c.txt", "lastModifiedDateTime": "2024-05-03T10:00:00Z",
                     "file": {}}
                ]
            })),
            content if content.starts_with("/graph/v1.0/drives/drive-b/items/") && content.ends_with("/content") => {
                if state.reject_next_download.swap(false, Ordering::SeqCst) {
                    return Reply::status(401);
                }
                let item = content.trim_start_matches("/graph/v1.0/drives/drive-b/items/").trim_end_matches("/content");
                Reply::bytes(format!("body of {item}").as_bytes())
            }
            _ => Reply::status(404),
        }
    })
}

fn factory(server: &MockServer) -> SharepointSourceFactory {
    let endpoints = SharepointEndpoints {
        login_base: format!("{}/login", server.base),
        graph_base: format!("{}/graph/v1.0", server.base),
        scope: "https://graph.microsoft.com/.default".to_string(),
    };
    SharepointSourceFactory::new(&HttpOptions::default(), endpoints).unwrap()
}

fn metadata() -> SourceMetadata {
    SourceMetadata::Sharepoint(SharepointMetadata {
        site_url: "https://contoso.sharepoint.com/sites/Study".to_string(),
        drive_name: "team forms".to_string(),
        folder_path: Some("Uploads".to_string()),
    })
}

fn modified_at(value: &str) -> Timestamp {
    Timestamp::parse_rfc3339(value).unwrap()
}

fn credential() -> Secret {
    secret(&json!({"tenant_id": "tenant-1", "client_id": "app", "client_secret": "shh"}))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[tokio::test]
async fn files_across_pages_and_subfolders_stream_in_order() {
    let state = Arc::new(GraphState {
        tokens_issued: AtomicUsize::new(0),
        reject_next_download: AtomicBool::new(false),
        paging_base: None,
    });
    let server = graph_server(Arc::clone(&state));
    let source = factory(&server).build(&source_instance("sp-1", metadata())).unwrap();
    let credential = credential();

    let mut stream = source.list_changes(&Watermark::origin(), &credential).await.unwrap();
    let mut items = Vec::new();
    while let Some(item) = stream.next_item(&credential).await.unwrap() {
        items.push(item);
    }
    let ids: Vec<&str> = items.iter().map(|item| item.external_id.as_str()).collect();
    assert_eq!(ids, vec!["b.csv", "a.json", "sub/c.txt"]);
    assert_eq!(items[0].payload.content_type, "text/csv");
    assert_eq!(items[0].payload.bytes, b"body of item-b".to_vec());
    assert_eq!(items[2].payload.content_type, "application/octet-stream");
    assert_eq!(state.tokens_issued.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_download_drops_the_cached_token() {
    let state = Arc::new(GraphState {
        tokens_issued: AtomicUsize::new(0),
        reject_next_download: AtomicBool::new(true),
        paging_base: None,
    });
    let server = graph_server(Arc::clone(&state));
    let source = factory(&server).build(&source_instance("sp-1", metadata())).unwrap();
    let credential = credential();

    let since = Watermark::at(modified_at("2024-05-02T10:00:00Z"), ExternalId::new("a.json"));
    let mut stream = source.list_changes(&since, &credential).await.unwrap();
    let error = stream.next_item(&credential).await.unwrap_err();
    assert!(matches!(error, ConnectorError::AuthExpired(_)));

    let item = stream.next_item(&credential).await.unwrap().unwrap();
    assert_eq!(item.external_id, ExternalId::new("sub/c.txt"));
    assert_eq!(state.tokens_issued.load(Ordering::SeqCst), 2);
    assert!(stream.next_item(&credential).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_library_is_permanent() {
    let state = Arc::new(GraphState {
        tokens_issued: AtomicUsize::new(0),
        reject_next_download: AtomicBool::new(false),
        paging_base: None,
    });
    let server = graph_server(state);
    let mut instance = source_instance("sp-1", metadata());
    instance.connector = SourceMetadata::Sharepoint(SharepointMetadata {
        site_url: "https://contoso.sharepoint.com/sites/Study".to_string(),
        drive_name: "Missing".to_string(),
        folder_path: None,
    });
    let source = factory(&server).build(&instance).unwrap();
    let error = source.list_changes(&Watermark::origin(), &credential()).await.err().unwrap();
    assert!(matches!(error, ConnectorError::Permanent(message) if message.contains("Missing")));
}

#[tokio::test]
async fn next_link_to_another_origin_is_refused_without_sending_the_token() {
    let elsewhere = MockServer::start(|_| Reply::json(&json!({"value": []})));
    let state = Arc::new(GraphState {
        tokens_issued: AtomicUsize::new(0),
        reject_next_download: AtomicBool::new(false),
        paging_base: Some(elsewhere.base.clone()),
    });
    let server = graph_server(state);
    let source = factory(&server).build(&source_instance("sp-1", metadata())).unwrap();

    let error = source.list_changes(&Watermark::origin(), &credential()).await.err().unwrap();
    assert!(matches!(error, ConnectorError::Malformed(message) if message.contains("next link")));
    assert!(elsewhere.requests().is_empty());
}
