// crates/lochness-connectors/tests/common/mod.rs
// ============================================================================
// Module: Common Test Utilities
// Description: Scripted HTTP server and catalog builders for connector tests.
// Purpose: Exercise HTTP connectors against local vendor stand-ins.
// Dependencies: lochness-core, tiny_http, url
// ============================================================================

//! ## Overview
//! [`MockServer`] answers every request through a handler closure and keeps
//! a log of what it received so tests can assert on the wire traffic.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    dead_code,
    reason = "Test-only helpers; not every test file uses every helper."
)]

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::thread::JoinHandle;

use lochness_core::DataSinkInstance;
use lochness_core::DataSourceInstance;
use lochness_core::InstanceRef;
use lochness_core::ObjectContext;
use lochness_core::ProjectId;
use lochness_core::Secret;
use lochness_core::SinkInstanceId;
use lochness_core::SinkMetadata;
use lochness_core::SiteId;
use lochness_core::SourceInstanceId;
use lochness_core::SourceMetadata;
use lochness_core::SubjectId;
use tiny_http::Header;
use tiny_http::Response;
use tiny_http::Server;

// ============================================================================
// SECTION: Mock Server
// ============================================================================

/// One request as received by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: String,
    /// Path and query.
    pub url: String,
    /// Headers with lowercase names.
    pub headers: BTreeMap<String, String>,
    /// Raw body.
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Returns the path without the query.
    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(path, _)| path)
    }

    /// Decodes the query string.
    pub fn query(&self) -> BTreeMap<String, String> {
        let query = self.url.split_once('?').map_or("", |(_, query)| query);
        url::form_urlencoded::parse(query.as_bytes()).into_owned().collect()
    }

    /// Decodes a url-encoded form body.
    pub fn form(&self) -> BTreeMap<String, String> {
        url::form_urlencoded::parse(&self.body).into_owned().collect()
    }

    /// Returns a header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// Canned response.
pub struct Reply {
    /// Status code.
    pub status: u16,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: Vec<u8>,
}

impl Reply {
    /// JSON reply with status 200.
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            status: 200,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(value).unwrap(),
        }
    }

    /// Raw bytes with status 200.
    pub fn bytes(body: &[u8]) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_vec(),
        }
    }

    /// Empty reply with the given status.
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Local HTTP server driven by a handler closure.
pub struct MockServer {
    /// Base URL (`http://127.0.0.1:port`).
    pub base: String,
    /// Received requests in arrival order.
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    /// Underlying server.
    server: Arc<Server>,
    /// Serving thread.
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    /// Starts a server answering every request with `handler`.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> Reply + Send + 'static,
    {
        let server = Arc::new(Server::http("127.0.0.1:0").unwrap());
        let base = format!("http://{}", server.server_addr().to_ip().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handle = {
            let server = Arc::clone(&server);
            let requests = Arc::clone(&requests);
            thread::spawn(move || {
                for mut request in server.incoming_requests() {
                    let mut body = Vec::new();
                    let _ = request.as_reader().read_to_end(&mut body);
                    let recorded = RecordedRequest {
                        method: request.method().to_string(),
                        url: request.url().to_string(),
                        headers: request
                            .headers()
                            .iter()
                            .map(|header| {
                                (header.field.to_string().to_ascii_lowercase(), header.value.to_string())
                            })
                            .collect(),
                        body,
                    };
                    let reply = handler(&recorded);
                    requests.lock().unwrap().push(recorded);
                    let mut response = Response::from_data(reply.body).with_status_code(reply.status);
                    for (name, value) in reply.headers {
                        response = response
                            .with_header(Header::from_bytes(name.as_bytes(), value.as_bytes()).unwrap());
                    }
                    let _ = request.respond(response);
                }
            })
        };
        Self {
            base,
            requests,
            server,
            handle: Some(handle),
        }
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ============================================================================
// SECTION: Catalog Builders
// ============================================================================

/// Source instance in project `lab`, site `boston`.
pub fn source_instance(id: &str, connector: SourceMetadata) -> DataSourceInstance {
    DataSourceInstance {
        id: SourceInstanceId::new(id),
        project: ProjectId::new("lab"),
        site: SiteId::new("boston"),
        connector,
        credential_ref: InstanceRef::new(format!("{id}-cred")),
        sink: None,
        active: true,
    }
}

/// Sink instance in project `lab`, site `boston`.
pub fn sink_instance(id: &str, connector: SinkMetadata) -> DataSinkInstance {
    DataSinkInstance {
        id: SinkInstanceId::new(id),
        project: ProjectId::new("lab"),
        site: SiteId::new("boston"),
        connector,
        credential_ref: InstanceRef::new(format!("{id}-cred")),
    }
}

/// Object context for `lab/boston/<source>`.
pub fn object_context(source: &str, subject: Option<&str>) -> ObjectContext {
    ObjectContext {
        project: ProjectId::new("lab"),
        site: SiteId::new("boston"),
        source_instance: SourceInstanceId::new(source),
        subject: subject.map(SubjectId::new),
    }
}

/// Secret holding a JSON document.
pub fn secret(value: &serde_json::Value) -> Secret {
    Secret::new(serde_json::to_vec(value).unwrap())
}
