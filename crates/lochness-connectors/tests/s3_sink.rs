// crates/lochness-connectors/tests/s3_sink.rs
// ============================================================================
// Module: S3 Sink Tests
// Description: Object uploads against a mock path-style S3 endpoint.
// Purpose: Pin digest idempotency, metadata headers, and error mapping.
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

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use lochness_connectors::S3SinkFactory;
use lochness_connectors::SinkFactory;
use lochness_core::ConnectorError;
use lochness_core::ObjectKey;
use lochness_core::Payload;
use lochness_core::S3Metadata;
use lochness_core::Secret;
use lochness_core::SinkMetadata;
use serde_json::json;

use crate::common::MockServer;
use crate::common::Reply;
use crate::common::object_context;
use crate::common::secret;
use crate::common::sink_instance;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Object path to stored `x-amz-meta-sha256` value.
type Objects = Arc<Mutex<BTreeMap<String, String>>>;

const ACCESS_KEY: &str = "AKIDEXAMPLE";

fn signed_by_vault_key(authorization: Option<&str>) -> bool {
    authorization.is_some_and(|value| {
        value.starts_with("AWS4-HMAC-SHA256") && value.contains(&format!("Credential={ACCESS_KEY}/"))
    })
}

fn bucket_server(objects: Objects) -> MockServer {
    MockServer::start(move |request| {
        if !signed_by_vault_key(request.header("authorization")) {
            return Reply::status(403);
        }
        let path = request.path().to_string();
        match request.method.as_str() {
            "HEAD" => match objects.lock().unwrap().get(&path) {
                Some(digest) => Reply::status(200).with_header("x-amz-meta-sha256", digest),
                None => Reply::status(404),
            },
            "PUT" => {
                let digest = request.header("x-amz-meta-sha256").unwrap().to_string();
                objects.lock().unwrap().insert(path, digest);
                Reply::status(200).with_header("ETag", "\"etag\"")
            }
            _ => Reply::status(405),
        }
    })
}

fn error_reply(status: u16, code: &str) -> Reply {
    let body = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <Error><Code>{code}</Code><Message>{code}</Message><RequestId>req-1</RequestId></Error>"
    );
    Reply {
        status,
        ..Reply::bytes(body.as_bytes())
    }
    .with_header("Content-Type", "application/xml")
}

fn metadata(server: &MockServer) -> SinkMetadata {
    SinkMetadata::S3(S3Metadata {
        bucket: "raw-data".to_string(),
        region: None,
        endpoint: Some(server.base.clone()),
        prefix: None,
        force_path_style: true,
    })
}

fn credential() -> Secret {
    secret(&json!({"access_key": ACCESS_KEY, "secret_key": "c2VjcmV0"}))
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[tokio::test]
async fn repeated_put_of_identical_content_skips_the_upload() {
    let objects: Objects = Arc::new(Mutex::new(BTreeMap::new()));
    let server = bucket_server(Arc::clone(&objects));
    let sink = S3SinkFactory::new().build(&sink_instance("s3-1", metadata(&server))).unwrap();
    let key = ObjectKey::from_stored("lab/redcap-1/1001");
    let payload = Payload::json(br#"{"record_id":"1001"}"#.to_vec());
    let context = object_context("redcap-1", Some("S-1"));

    let first = sink.put(&key, &payload, &context, &credential()).await.unwrap();
    assert!(first.written);
    assert_eq!(first.digest, payload.digest());
    let second = sink.put(&key, &payload, &context, &credential()).await.unwrap();
    assert!(!second.written);
    assert_eq!(second.digest, payload.digest());

    let requests = server.requests();
    let uploads: Vec<_> = requests.iter().filter(|request| request.method == "PUT").collect();
    assert_eq!(uploads.len(), 1);
    assert_eq!(requests.iter().filter(|request| request.method == "HEAD").count(), 2);
    let upload = uploads[0];
    assert_eq!(upload.path(), "/raw-data/lab/redcap-1/1001");
    assert_eq!(upload.header("x-amz-meta-project"), Some("lab"));
    assert_eq!(upload.header("x-amz-meta-source-instance"), Some("redcap-1"));
    assert_eq!(upload.header("x-amz-meta-subject"), Some("S-1"));
    assert_eq!(upload.header("content-type"), Some("application/json"));
}

#[tokio::test]
async fn changed_content_overwrites_the_object() {
    let objects: Objects = Arc::new(Mutex::new(BTreeMap::new()));
    let server = bucket_server(Arc::clone(&objects));
    let sink = S3SinkFactory::new().build(&sink_instance("s3-1", metadata(&server))).unwrap();
    let key = ObjectKey::from_stored("lab/redcap-1/1001");
    let context = object_context("redcap-1", None);

    sink.put(&key, &Payload::json(b"[1]".to_vec()), &context, &credential()).await.unwrap();
    let updated = Payload::json(b"[1,2]".to_vec());
    let ack = sink.put(&key, &updated, &context, &credential()).await.unwrap();
    assert!(ack.written);
    let stored = objects.lock().unwrap().get("/raw-data/lab/redcap-1/1001").cloned();
    assert_eq!(stored, Some(updated.digest()));
    assert_eq!(server.requests().iter().filter(|request| request.method == "PUT").count(), 2);
}

#[tokio::test]
async fn access_denied_is_permanent() {
    let server = MockServer::start(|request| {
        if request.method == "HEAD" {
            return Reply::status(404);
        }
        error_reply(403, "AccessDenied")
    });
    let sink = S3SinkFactory::new().build(&sink_instance("s3-1", metadata(&server))).unwrap();
    let error = sink
        .put(
            &ObjectKey::from_stored("lab/x/1"),
            &Payload::json(b"{}".to_vec()),
            &object_context("x", None),
            &credential(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ConnectorError::Permanent(_)), "{error:?}");
}

#[tokio::test]
async fn slow_down_is_transient() {
    let server = MockServer::start(|request| {
        if request.method == "HEAD" {
            return Reply::status(404);
        }
        error_reply(503, "SlowDown")
    });
    let sink = S3SinkFactory::new().build(&sink_instance("s3-1", metadata(&server))).unwrap();
    let error = sink
        .put(
            &ObjectKey::from_stored("lab/x/1"),
            &Payload::json(b"{}".to_vec()),
            &object_context("x", None),
            &credential(),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, ConnectorError::Transient(_)), "{error:?}");
}

#[test]
fn credential_fields_name_the_static_key_pair() {
    let factory = S3SinkFactory::new();
    assert!(factory.validate_credential(&credential()).is_ok());
    assert!(factory.validate_credential(&secret(&json!({"access_key": ACCESS_KEY}))).is_err());
}
