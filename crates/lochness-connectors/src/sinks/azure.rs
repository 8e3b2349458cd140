// crates/lochness-connectors/src/sinks/azure.rs
// ============================================================================
// Module: Azure Blob Sink
// Description: Block blob uploads authorized by a shared access signature.
// Purpose: Store change payloads in an Azure Blob container.
// Dependencies: lochness-core, reqwest, url, zeroize
// ============================================================================

//! ## Overview
//! The credential carries a storage connection string. Only SAS connection
//! strings are accepted (`BlobEndpoint=...;SharedAccessSignature=...` or
//! `AccountName=...;SharedAccessSignature=...`); account-key strings are
//! rejected when the credential is validated.
//!
//! Azure metadata names must be valid C# identifiers, so catalog context
//! names are written with `_` in place of `-`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use async_trait::async_trait;
use lochness_core::ConnectorError;
use lochness_core::DataSinkInstance;
use lochness_core::DataSinkType;
use lochness_core::ObjectContext;
use lochness_core::ObjectKey;
use lochness_core::Payload;
use lochness_core::PutAck;
use lochness_core::Secret;
use lochness_core::SinkConnector;
use lochness_core::SinkMetadata;
use reqwest::Client;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use crate::http::HttpOptions;
use crate::http::build_client;
use crate::http::classify_status;
use crate::http::endpoint;
use crate::http::send;
use crate::http::transport_error;
use crate::registry::SinkFactory;
use crate::sinks::DIGEST_METADATA_KEY;
use crate::sinks::descriptor_named;
use crate::sinks::wrong_metadata;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Blob service REST version.
const API_VERSION: &str = "2021-08-06";
/// Metadata header prefix.
const META_PREFIX: &str = "x-ms-meta-";

// ============================================================================
// SECTION: Connection String
// ============================================================================

/// Parsed SAS connection string.
pub struct AzureConnection {
    /// Blob service endpoint without a trailing slash.
    endpoint: String,
    /// SAS query string without a leading `?`.
    sas: Zeroizing<String>,
}

impl fmt::Debug for AzureConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConnection")
            .field("endpoint", &self.endpoint)
            .field("sas", &"<redacted>")
            .finish()
    }
}

impl AzureConnection {
    /// Parses a storage connection string.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Malformed`] for unparsable strings, strings
    /// without a SAS, and account-key strings.
    pub fn parse(raw: &str) -> Result<Self, ConnectorError> {
        let mut protocol = None;
        let mut account = None;
        let mut suffix = None;
        let mut blob_endpoint = None;
        let mut sas = None;
        let mut has_account_key = false;
        for part in raw.split(';').map(str::trim).filter(|part| !part.is_empty()) {
            let Some((name, value)) = part.split_once('=') else {
                return Err(ConnectorError::Malformed(
                    "connection string entry without '='".to_string(),
                ));
            };
            match name.trim() {
                "DefaultEndpointsProtocol" => protocol = Some(value.trim()),
                "AccountName" => account = Some(value.trim()),
                "EndpointSuffix" => suffix = Some(value.trim()),
                "BlobEndpoint" => blob_endpoint = Some(value.trim()),
                "SharedAccessSignature" => sas = Some(value.trim()),
                "AccountKey" => has_account_key = true,
                _ => {}
            }
        }
        let Some(sas) = sas.map(|value| value.trim_start_matches('?')).filter(|value| !value.is_empty())
        else {
            let reason = if has_account_key {
                "account key connection strings are not supported; use a SharedAccessSignature"
            } else {
                "connection string has no SharedAccessSignature"
            };
            return Err(ConnectorError::Malformed(reason.to_string()));
        };
        let endpoint = match (blob_endpoint, account) {
            (Some(blob_endpoint), _) => blob_endpoint.trim_end_matches('/').to_string(),
            (None, Some(account)) => format!(
                "{}://{account}.blob.{}",
                protocol.unwrap_or("https"),
                suffix.unwrap_or("core.windows.net")
            ),
            (None, None) => {
                return Err(ConnectorError::Malformed(
                    "connection string has neither BlobEndpoint nor AccountName".to_string(),
                ));
            }
        };
        Url::parse(&endpoint)
            .map_err(|err| ConnectorError::Malformed(format!("invalid blob endpoint: {err}")))?;
        Ok(Self {
            endpoint,
            sas: Zeroizing::new(sas.to_string()),
        })
    }

    /// Returns the blob service endpoint.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Returns the signed URL of a blob.
    fn blob_url(&self, container: &str, key: &ObjectKey) -> Result<Url, ConnectorError> {
        let mut segments = vec![container];
        segments.extend(key.as_str().split('/'));
        let mut url = endpoint(&self.endpoint, &segments)?;
        url.set_query(Some(self.sas.as_str()));
        Ok(url)
    }
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// Azure Blob container sink.
pub struct AzureBlobSink {
    /// Shared HTTP client.
    client: Client,
    /// Container name.
    container: String,
}

impl AzureBlobSink {
    /// Returns the digest already stored on the blob, if any.
    async fn stored_digest(&self, url: Url) -> Result<Option<String>, ConnectorError> {
        let response = self
            .client
            .head(url)
            .header("x-ms-version", API_VERSION)
            .send()
            .await
            .map_err(|err| transport_error(err, "azure blob properties"))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status, "azure blob properties"));
        }
        let header = format!("{META_PREFIX}{DIGEST_METADATA_KEY}");
        Ok(response
            .headers()
            .get(header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::to_string))
    }
}

#[async_trait]
impl SinkConnector for AzureBlobSink {
    async fn put(
        &self,
        key: &ObjectKey,
        payload: &Payload,
        context: &ObjectContext,
        credential: &Secret,
    ) -> Result<PutAck, ConnectorError> {
        let connection_string = credential.field("connection_string")?;
        let connection = AzureConnection::parse(&connection_string)?;
        let url = connection.blob_url(&self.container, key)?;
        let digest = payload.digest();
        if self.stored_digest(url.clone()).await?.as_deref() == Some(digest.as_str()) {
            debug!(container = %self.container, key = %key, "azure blob unchanged");
            return Ok(PutAck {
                key: key.clone(),
                digest,
                written: false,
            });
        }
        let mut request = self
            .client
            .put(url)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-blob-type", "BlockBlob")
            .header("content-type", payload.content_type.as_str())
            .header(format!("{META_PREFIX}{DIGEST_METADATA_KEY}"), digest.as_str())
            .body(payload.bytes.clone());
        for (name, value) in context.metadata_pairs() {
            request = request.header(format!("{META_PREFIX}{}", name.replace('-', "_")), value);
        }
        send(request, "azure blob upload").await?;
        Ok(PutAck {
            key: key.clone(),
            digest,
            written: true,
        })
    }
}

// ============================================================================
// SECTION: Factory
// ============================================================================

/// Factory for `azure_blob` sinks.
pub struct AzureBlobSinkFactory {
    /// Shared HTTP client.
    client: Client,
}

impl AzureBlobSinkFactory {
    /// Creates the factory and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Permanent`] when the client cannot be built.
    pub fn new(options: &HttpOptions) -> Result<Self, ConnectorError> {
        Ok(Self {
            client: build_client(options)?,
        })
    }
}

impl SinkFactory for AzureBlobSinkFactory {
    fn descriptor(&self) -> DataSinkType {
        descriptor_named("azure_blob")
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &["connection_string"]
    }

    fn validate_credential(&self, credential: &Secret) -> Result<(), ConnectorError> {
        let connection_string = credential.field("connection_string")?;
        AzureConnection::parse(&connection_string)?;
        Ok(())
    }

    fn build(&self, instance: &DataSinkInstance) -> Result<Box<dyn SinkConnector>, ConnectorError> {
        let SinkMetadata::AzureBlob(meta) = &instance.connector else {
            return Err(wrong_metadata("azure_blob", &instance.connector));
        };
        Ok(Box::new(AzureBlobSink {
            client: self.client.clone(),
            container: meta.container.clone(),
        }))
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, clippy::unwrap_used, reason = "Test-only assertions.")]

    use lochness_core::ConnectorError;
    use lochness_core::ObjectKey;

    use super::AzureConnection;

    #[test]
    fn blob_endpoint_strings_keep_their_endpoint() {
        let connection = AzureConnection::parse(
            "BlobEndpoint=http://127.0.0.1:10000/devstoreaccount1/;SharedAccessSignature=?sv=2021&sig=abc%3D",
        )
        .unwrap();
        assert_eq!(connection.endpoint(), "http://127.0.0.1:10000/devstoreaccount1");
        let url = connection
            .blob_url("raw", &ObjectKey::from_stored("lab/redcap-1/1001"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:10000/devstoreaccount1/raw/lab/redcap-1/1001?sv=2021&sig=abc%3D"
        );
    }

    #[test]
    fn account_strings_derive_the_endpoint() {
        let connection = AzureConnection::parse(
            "DefaultEndpointsProtocol=https;AccountName=lochness;EndpointSuffix=core.windows.net;SharedAccessSignature=sv=1&sig=x",
        )
        .unwrap();
        assert_eq!(connection.endpoint(), "https://lochness.blob.core.windows.net");
    }

    #[test]
    fn account_key_strings_are_rejected() {
        let error = AzureConnection::parse(
            "DefaultEndpointsProtocol=https;AccountName=lochness;AccountKey=c2VjcmV0",
        )
        .unwrap_err();
        assert!(matches!(error, ConnectorError::Malformed(message) if message.contains("account key")));
        assert!(AzureConnection::parse("garbage").is_err());
    }
}
