// crates/lochness-connectors/src/http.rs
// ============================================================================
// Module: Connector HTTP Plumbing
// Description: Shared reqwest client construction and response classification.
// Purpose: Map vendor HTTP outcomes onto the connector error taxonomy.
// Dependencies: lochness-core, reqwest, serde
// ============================================================================

//! ## Overview
//! Every HTTP connector sends requests through [`send`] so status codes are
//! classified the same way everywhere. Response bodies are treated as
//! untrusted: sizes are capped and error messages never echo body content,
//! which may carry participant data.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::Duration;

use lochness_core::ConnectorError;
use lochness_core::Timestamp;
use reqwest::Client;
use reqwest::RequestBuilder;
use reqwest::Response;
use reqwest::StatusCode;
use reqwest::header::DATE;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

// ============================================================================
// SECTION: Options
// ============================================================================

/// Default request timeout (ms).
const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// Default connect timeout (ms).
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Default maximum accepted response body (bytes).
const DEFAULT_MAX_BODY_BYTES: u64 = 1024 * 1024 * 1024;

/// HTTP client settings shared by the HTTP connectors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HttpOptions {
    /// Whole-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Largest response body accepted, in bytes.
    pub max_body_bytes: u64,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            user_agent: format!("lochness/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Builds an async client from the options.
///
/// # Errors
///
/// Returns [`ConnectorError::Permanent`] when the TLS backend cannot start.
pub(crate) fn build_client(options: &HttpOptions) -> Result<Client, ConnectorError> {
    Client::builder()
        .timeout(Duration::from_millis(options.timeout_ms))
        .connect_timeout(Duration::from_millis(options.connect_timeout_ms))
        .user_agent(options.user_agent.clone())
        .build()
        .map_err(|err| ConnectorError::Permanent(format!("http client setup failed: {err}")))
}

/// Appends percent-encoded path segments to a base URL.
///
/// # Errors
///
/// Returns [`ConnectorError::Permanent`] when `base` is not a hierarchical URL.
pub(crate) fn endpoint(base: &str, segments: &[&str]) -> Result<Url, ConnectorError> {
    let mut url = Url::parse(base)
        .map_err(|err| ConnectorError::Permanent(format!("invalid endpoint {base:?}: {err}")))?;
    url.path_segments_mut()
        .map_err(|()| ConnectorError::Permanent(format!("endpoint {base:?} cannot carry a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

// ============================================================================
// SECTION: Classification
// ============================================================================

/// Maps a non-success status onto the connector error taxonomy.
#[must_use]
pub fn classify_status(status: StatusCode, context: &str) -> ConnectorError {
    let message = format!("{context}: http status {}", status.as_u16());
    match status.as_u16() {
        401 => ConnectorError::AuthExpired(message),
        403 => ConnectorError::Permanent(message),
        408 | 429 => ConnectorError::Transient(message),
        410 => ConnectorError::CursorExpired(message),
        code if code >= 500 => ConnectorError::Transient(message),
        _ => ConnectorError::Permanent(message),
    }
}

/// Maps a transport failure onto the connector error taxonomy.
pub(crate) fn transport_error(error: reqwest::Error, context: &str) -> ConnectorError {
    if error.is_decode() {
        return ConnectorError::Malformed(format!("{context}: undecodable response"));
    }
    if error.is_builder() {
        return ConnectorError::Permanent(format!("{context}: invalid request: {error}"));
    }
    ConnectorError::Transient(format!("{context}: {}", error.without_url()))
}

// ============================================================================
// SECTION: Requests
// ============================================================================

/// Sends a request and fails on any non-success status.
///
/// # Errors
///
/// Returns the classified [`ConnectorError`] for transport failures and
/// non-2xx responses.
pub(crate) async fn send(request: RequestBuilder, context: &str) -> Result<Response, ConnectorError> {
    let response = request.send().await.map_err(|err| transport_error(err, context))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(classify_status(status, context))
}

/// Returns the server clock from the `Date` header, or the local clock when
/// the header is absent or unreadable.
pub(crate) fn server_time(response: &Response) -> Timestamp {
    response
        .headers()
        .get(DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Timestamp::parse_http_date(value).ok())
        .unwrap_or_else(Timestamp::now)
}

/// Reads a response body with a size cap.
///
/// # Errors
///
/// Returns [`ConnectorError::Permanent`] when the body exceeds `max_bytes`.
pub(crate) async fn read_bytes(
    response: Response,
    max_bytes: u64,
    context: &str,
) -> Result<Vec<u8>, ConnectorError> {
    if let Some(length) = response.content_length()
        && length > max_bytes
    {
        return Err(ConnectorError::Permanent(format!(
            "{context}: body of {length} bytes exceeds limit {max_bytes}"
        )));
    }
    let bytes = response.bytes().await.map_err(|err| transport_error(err, context))?;
    let length = u64::try_from(bytes.len()).unwrap_or(u64::MAX);
    if length > max_bytes {
        return Err(ConnectorError::Permanent(format!(
            "{context}: body of {length} bytes exceeds limit {max_bytes}"
        )));
    }
    Ok(bytes.to_vec())
}

/// Reads and decodes a JSON response body.
///
/// # Errors
///
/// Returns [`ConnectorError::Malformed`] when the body does not decode as `T`.
pub(crate) async fn read_json<T: DeserializeOwned>(
    response: Response,
    max_bytes: u64,
    context: &str,
) -> Result<T, ConnectorError> {
    let bytes = read_bytes(response, max_bytes, context).await?;
    serde_json::from_slice(&bytes)
        .map_err(|err| ConnectorError::Malformed(format!("{context}: unexpected body shape: {err}")))
}

// ============================================================================
// SECTION: Tests
// ============================================================================
