// crates/lochness-connectors/tests/xnat_source.rs
// ============================================================================
// Module: XNAT Source Tests
// Description: Experiment listing and retrieval against a mock XNAT.
// Purpose: Pin auth, ordering, lazy fetch, and archive retrieval.
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
use std::sync::Mutex;

use lochness_connectors::SourceFactory;
use lochness_connectors::XnatSourceFactory;
use lochness_connectors::http::HttpOptions;
use lochness_core::ConnectorError;
use lochness_core::ExternalId;
use lochness_core::SourceMetadata;
use lochness_core::SubjectId;
use lochness_core::Watermark;
use lochness_core::XnatMetadata;
use serde_json::json;

use crate::common::MockServer;
use crate::common::Reply;
use crate::common::secret;
use crate::common::source_instance;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// `Basic base64("alias:alias")`.
const ALIAS_AUTH: &str = "Basic YWxpYXM6YWxpYXM=";

fn xnat_server() -> MockServer {
    MockServer::start(|request| {
        if request.header("authorization") != Some(ALIAS_AUTH) {
            return Reply::status(401);
        }
        match request.path() {
            "/xnat/data/projects/PRONET/experiments" => Reply::json(&json!({
                "ResultSet": {
                    "totalRecords": "3",
                    "Result": [
                        {"ID": "XNAT_E00002", "label": "S2_MR1", "subject_label": "S2",
                         "insert_date": "2024-04-01 09:00:00.0", "last_modified": "2024-05-02 08:00:00.512"},
                        {"ID": "XNAT_E00001", "label": "S1_MR1", "subject_label": "S1",
                         "insert_date": "2024-04-01 09:00:00.0", "last_modified": "2024-05-01 08:00:00.1"},
                        {"ID": "XNAT_E00003", "label": "S3_MR1", "subject_label": "",
                         "insert_date": "2024-05-03 10:00:00.0", "last_modified": ""}
                    ]
                }
            })),
            "/xnat/data/experiments/XNAT_E00001" => Reply::json(&json!({"items": [{"id": "XNAT_E00001"}]})),
            "/xnat/data/experiments/XNAT_E00002" => Reply::json(&json!({"items": [{"id": "XNAT_E00002"}]})),
            "/xnat/data/experiments/XNAT_E00003" => Reply::status(500),
            "/xnat/data/experiments/XNAT_E00001/scans/ALL/files" => Reply::bytes(b"PK\x03\x04archive"),
            _ => Reply::status(404),
        }
    })
}

fn metadata(server: &MockServer, include_archive: bool) -> SourceMetadata {
    SourceMetadata::Xnat(XnatMetadata {
        endpoint_url: format!("{}/xnat", server.base),
        project: "PRONET".to_string(),
        include_archive,
    })
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[tokio::test]
async fn experiments_stream_in_modification_order() {
    let server = xnat_server();
    let factory = XnatSourceFactory::new(&HttpOptions::default()).unwrap();
    let source = factory.build(&source_instance("xnat-1", metadata(&server, false))).unwrap();
    let credential = secret(&json!({"api_token": "alias"}));

    let mut stream = source.list_changes(&Watermark::origin(), &credential).await.unwrap();
    let first = stream.next_item(&credential).await.unwrap().unwrap();
    assert_eq!(first.external_id, ExternalId::new("XNAT_E00001"));
    assert_eq!(first.subject_id, Some(SubjectId::new("S1")));
    assert_eq!(first.payload.content_type, "application/json");
    let second = stream.next_item(&credential).await.unwrap().unwrap();
    assert_eq!(second.external_id, ExternalId::new("XNAT_E00002"));

    let error = stream.next_item(&credential).await.unwrap_err();
    assert!(matches!(error, ConnectorError::Transient(_)));
    let error = stream.next_item(&credential).await.unwrap_err();
    assert!(matches!(error, ConnectorError::Transient(_)), "failed fetch keeps the item pending");

    let listing = &server.requests()[0];
    assert_eq!(listing.query().get("format").map(String::as_str), Some("json"));
}

#[tokio::test]
async fn watermark_skips_already_synced_experiments() {
    let server = xnat_server();
    let factory = XnatSourceFactory::new(&HttpOptions::default()).unwrap();
    let source = factory.build(&source_instance("xnat-1", metadata(&server, false))).unwrap();
    let credential = secret(&json!({"api_token": "alias"}));

    let mut stream = source.list_changes(&Watermark::origin(), &credential).await.unwrap();
    let first = stream.next_item(&credential).await.unwrap().unwrap();
    let second = stream.next_item(&credential).await.unwrap().unwrap();

    let mut stream = source.list_changes(&second.watermark(), &credential).await.unwrap();
    let error = stream.next_item(&credential).await.unwrap_err();
    assert!(matches!(error, ConnectorError::Transient(_)), "only XNAT_E00003 remains");
    assert!(first.watermark() < second.watermark());
}

#[tokio::test]
async fn archive_mode_downloads_scan_zip() {
    let server = xnat_server();
    let factory = XnatSourceFactory::new(&HttpOptions::default()).unwrap();
    let source = factory.build(&source_instance("xnat-1", metadata(&server, true))).unwrap();
    let credential = secret(&json!({"api_token": "alias"}));

    let mut stream = source.list_changes(&Watermark::origin(), &credential).await.unwrap();
    let first = stream.next_item(&credential).await.unwrap().unwrap();
    assert_eq!(first.payload.content_type, "application/zip");
    assert_eq!(first.payload.bytes, b"PK\x03\x04archive".to_vec());
    let fetch = &server.requests()[1];
    assert_eq!(fetch.query().get("format").map(String::as_str), Some("zip"));
}

#[tokio::test]
async fn experiments_modified_in_the_current_server_second_wait() {
    let date = Arc::new(Mutex::new("Wed, 01 May 2024 08:00:00 GMT".to_string()));
    let server = {
        let date = Arc::clone(&date);
        MockServer::start(move |request| {
            let reply = match request.path() {
                "/xnat/data/projects/PRONET/experiments" => Reply::json(&json!({
                    "ResultSet": {"Result": [
                        {"ID": "XNAT_E00009", "subject_label": "S9",
                         "insert_date": "2024-04-01 09:00:00.0", "last_modified": "2024-05-01 08:00:00.7"}
                    ]}
                })),
                _ => Reply::json(&json!({"items": []})),
            };
            reply.with_header("Date", &date.lock().unwrap())
        })
    };
    let factory = XnatSourceFactory::new(&HttpOptions::default()).unwrap();
    let source = factory.build(&source_instance("xnat-1", metadata(&server, false))).unwrap();
    let credential = secret(&json!({"api_token": "alias"}));

    let mut stream = source.list_changes(&Watermark::origin(), &credential).await.unwrap();
    assert!(stream.next_item(&credential).await.unwrap().is_none());

    *date.lock().unwrap() = "Wed, 01 May 2024 08:00:01 GMT".to_string();
    let mut stream = source.list_changes(&Watermark::origin(), &credential).await.unwrap();
    let item = stream.next_item(&credential).await.unwrap().unwrap();
    assert_eq!(item.external_id, ExternalId::new("XNAT_E00009"));
    assert!(stream.next_item(&credential).await.unwrap().is_none());
}

#[tokio::test]
async fn rejected_credentials_are_auth_expired() {
    let server = xnat_server();
    let factory = XnatSourceFactory::new(&HttpOptions::default()).unwrap();
    let source = factory.build(&source_instance("xnat-1", metadata(&server, false))).unwrap();
    let credential = secret(&json!({"username": "someone", "password": "wrong"}));

    let error = source.list_changes(&Watermark::origin(), &credential).await.err().unwrap();
    assert!(matches!(error, ConnectorError::AuthExpired(_)));
}

#[test]
fn credential_validation_accepts_token_or_password_pairs() {
    let factory = XnatSourceFactory::new(&HttpOptions::default()).unwrap();
    assert!(factory.validate_credential(&secret(&json!({"api_token": "alias"}))).is_ok());
    assert!(
        factory
            .validate_credential(&secret(&json!({"username": "u", "password": "p"})))
            .is_ok()
    );
    assert!(factory.validate_credential(&secret(&json!({"username": "u"}))).is_err());
}
