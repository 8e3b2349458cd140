// crates/lochness-connectors/src/sinks/s3.rs
// ============================================================================
// Module: S3 Sink
// Description: Object writes to S3 and S3-compatible stores.
// Purpose: Store change payloads in a bucket with digest-based idempotency.
// Dependencies: aws-config, aws-sdk-s3, lochness-core
// ============================================================================

//! ## Overview
//! Each put issues a `HeadObject` first; when the stored `sha256` metadata
//! matches the payload digest the upload is skipped. Static keys come from
//! the vault credential (`access_key`, `secret_key`, optional
//! `session_token`), so an S3 client is configured per call.

// ============================================================================
// SECTION: Imports
// ============================================================================

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_config::Region;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
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
use reqwest::StatusCode;
use tracing::debug;

use crate::http::classify_status;
use crate::registry::SinkFactory;
use crate::sinks::DIGEST_METADATA_KEY;
use crate::sinks::descriptor_named;
use crate::sinks::wrong_metadata;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Region used when the instance names none.
const DEFAULT_REGION: &str = "us-east-1";
/// Provider name attached to vault-sourced credentials.
const CREDENTIAL_PROVIDER: &str = "lochness-vault";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Error codes that mean the credential itself has lapsed.
const EXPIRED_CODES: &[&str] = &["ExpiredToken", "TokenRefreshRequired", "RequestExpired"];
/// Error codes returned for throttling.
const THROTTLE_CODES: &[&str] = &["SlowDown", "Throttling", "RequestTimeout"];

/// Maps an SDK failure onto the connector error taxonomy.
fn sdk_error<E: ProvideErrorMetadata>(error: &SdkError<E, HttpResponse>, context: &str) -> ConnectorError {
    match error {
        SdkError::ServiceError(service) => {
            let code = service.err().code().unwrap_or_default();
            if EXPIRED_CODES.contains(&code) {
                return ConnectorError::AuthExpired(format!("{context}: {code}"));
            }
            if THROTTLE_CODES.contains(&code) {
                return ConnectorError::Transient(format!("{context}: {code}"));
            }
            let status = StatusCode::from_u16(service.raw().status().as_u16())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            classify_status(status, context)
        }
        SdkError::ConstructionFailure(_) => {
            ConnectorError::Permanent(format!("{context}: request could not be built"))
        }
        SdkError::TimeoutError(_) => ConnectorError::Transient(format!("{context}: timed out")),
        SdkError::DispatchFailure(_) => ConnectorError::Transient(format!("{context}: dispatch failed")),
        SdkError::ResponseError(_) => {
            ConnectorError::Transient(format!("{context}: unreadable response"))
        }
        _ => ConnectorError::Transient(format!("{context}: request failed")),
    }
}

// ============================================================================
// SECTION: Sink
// ============================================================================

/// S3 bucket sink.
pub struct S3Sink {
    /// Bucket name.
    bucket: String,
    /// Region.
    region: String,
    /// Custom endpoint.
    endpoint: Option<String>,
    /// Path-style addressing.
    force_path_style: bool,
}

impl S3Sink {
    /// Builds a client carrying the vault credential.
    fn client(&self, credential: &Secret) -> Result<Client, ConnectorError> {
        let access_key = credential.field("access_key")?;
        let secret_key = credential.field("secret_key")?;
        let session_token = credential.optional_field("session_token")?;
        let credentials = Credentials::new(
            access_key.as_str(),
            secret_key.as_str(),
            session_token.map(|token| token.to_string()),
            None,
            CREDENTIAL_PROVIDER,
        );
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(self.force_path_style);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Ok(Client::from_conf(builder.build()))
    }

    /// Returns the digest already stored under `key`, if any.
    async fn stored_digest(&self, client: &Client, key: &str) -> Result<Option<String>, ConnectorError> {
        match client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => Ok(output
                .metadata()
                .and_then(|metadata| metadata.get(DIGEST_METADATA_KEY))
                .cloned()),
            Err(err) if err.as_service_error().is_some_and(|service| service.is_not_found()) => {
                Ok(None)
            }
            Err(err) => Err(sdk_error(&err, "s3 head object")),
        }
    }
}

#[async_trait]
impl SinkConnector for S3Sink {
    async fn put(
        &self,
        key: &ObjectKey,
        payload: &Payload,
        context: &ObjectContext,
        credential: &Secret,
    ) -> Result<PutAck, ConnectorError> {
        let client = self.client(credential)?;
        let digest = payload.digest();
        if self.stored_digest(&client, key.as_str()).await?.as_deref() == Some(digest.as_str()) {
            debug!(bucket = %self.bucket, key = %key, "s3 object unchanged");
            return Ok(PutAck {
                key: key.clone(),
                digest,
                written: false,
            });
        }
        let mut request = client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(&payload.content_type)
            .metadata(DIGEST_METADATA_KEY, &digest)
            .body(ByteStream::from(payload.bytes.clone()));
        for (name, value) in context.metadata_pairs() {
            request = request.metadata(name, value);
        }
        request.send().await.map_err(|err| sdk_error(&err, "s3 put object"))?;
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

/// Factory for `s3` sinks.
#[derive(Debug, Default)]
pub struct S3SinkFactory;

impl S3SinkFactory {
    /// Creates the factory.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SinkFactory for S3SinkFactory {
    fn descriptor(&self) -> DataSinkType {
        descriptor_named("s3")
    }

    fn credential_fields(&self) -> &'static [&'static str] {
        &["access_key", "secret_key"]
    }

    fn build(&self, instance: &DataSinkInstance) -> Result<Box<dyn SinkConnector>, ConnectorError> {
        let SinkMetadata::S3(meta) = &instance.connector else {
            return Err(wrong_metadata("s3", &instance.connector));
        };
        Ok(Box::new(S3Sink {
            bucket: meta.bucket.clone(),
            region: meta.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string()),
            endpoint: meta.endpoint.clone(),
            force_path_style: meta.force_path_style,
        }))
    }
}
