// crates/lochness-core/src/core/change.rs
// ============================================================================
// Module: Lochness Change Items
// Description: Items produced by sources and the deterministic sink object key.
// Purpose: Define the unit of transfer between a source and a sink.
// Dependencies: serde, sha2, hex
// ============================================================================

//! ## Overview
//! A [`ChangeItem`] is one created or updated record emitted by a source.
//! Sinks address it through an [`ObjectKey`] derived only from the source
//! instance and the item's external id, so redelivery of the same item always
//! lands on the same object.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use crate::core::identifiers::ExternalId;
use crate::core::identifiers::ProjectId;
use crate::core::identifiers::SiteId;
use crate::core::identifiers::SourceInstanceId;
use crate::core::identifiers::SubjectId;
use crate::core::time::Timestamp;
use crate::core::watermark::Watermark;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Maximum length of a single object key segment.
const MAX_SEGMENT_LENGTH: usize = 512;

// ============================================================================
// SECTION: Payload
// ============================================================================

/// Raw bytes of one transferred item.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload {
    /// Item content.
    pub bytes: Vec<u8>,
    /// MIME type reported to the sink.
    pub content_type: String,
}

impl Payload {
    /// Creates a payload.
    #[must_use]
    pub fn new(bytes: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }

    /// Creates a JSON payload.
    #[must_use]
    pub fn json(bytes: Vec<u8>) -> Self {
        Self::new(bytes, "application/json")
    }

    /// Returns the lowercase hex SHA-256 digest of the content.
    #[must_use]
    pub fn digest(&self) -> String {
        sha256_hex(&self.bytes)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("len", &self.bytes.len())
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Returns the lowercase hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// ============================================================================
// SECTION: Change Item
// ============================================================================

/// One created or updated record produced by a source connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeItem {
    /// Stable upstream identifier.
    pub external_id: ExternalId,
    /// Item content.
    pub payload: Payload,
    /// Upstream modification time used for ordering.
    pub produced_at: Timestamp,
    /// Subject the item belongs to, when the source knows it.
    pub subject_id: Option<SubjectId>,
}

impl ChangeItem {
    /// Returns the watermark covering this item.
    #[must_use]
    pub fn watermark(&self) -> Watermark {
        Watermark::at(self.produced_at, self.external_id.clone())
    }
}

// ============================================================================
// SECTION: Object Key
// ============================================================================

/// Object key validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid object key: {0}")]
pub struct KeyError(pub String);

/// Deterministic sink object key.
///
/// # Invariants
/// - `<prefix>/<source instance>/<external id>` with every segment validated.
/// - `/` and `%` inside the external id are percent-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Derives the object key for an item.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] when the prefix, instance id, or external id is not
    /// a safe key segment.
    pub fn for_item(
        prefix: Option<&str>,
        instance: &SourceInstanceId,
        external_id: &ExternalId,
    ) -> Result<Self, KeyError> {
        let mut segments = Vec::new();
        if let Some(prefix) = prefix {
            for segment in prefix.split('/').filter(|segment| !segment.is_empty()) {
                validate_segment(segment)?;
                segments.push(segment.to_string());
            }
        }
        validate_segment(instance.as_str())?;
        if instance.as_str().contains('/') {
            return Err(KeyError(format!("instance id contains '/': {instance}")));
        }
        segments.push(instance.as_str().to_string());
        let encoded = encode_segment(external_id.as_str());
        validate_segment(&encoded)?;
        segments.push(encoded);
        Ok(Self(segments.join("/")))
    }

    /// Wraps a previously derived key (for example one loaded from storage).
    #[must_use]
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejects empty, relative, overlong, or control-character segments.
fn validate_segment(segment: &str) -> Result<(), KeyError> {
    if segment.is_empty() {
        return Err(KeyError("empty key segment".to_string()));
    }
    if segment == "." || segment == ".." {
        return Err(KeyError(format!("relative key segment {segment:?}")));
    }
    if segment.len() > MAX_SEGMENT_LENGTH {
        return Err(KeyError("key segment exceeds length limit".to_string()));
    }
    if segment.chars().any(char::is_control) {
        return Err(KeyError("key segment contains control characters".to_string()));
    }
    Ok(())
}

/// Percent-encodes the characters that would change key structure.
fn encode_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(ch),
        }
    }
    out
}

// ============================================================================
// SECTION: Object Context
// ============================================================================

/// Catalog context attached to written objects as metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectContext {
    /// Owning project.
    pub project: ProjectId,
    /// Owning site.
    pub site: SiteId,
    /// Producing source instance.
    pub source_instance: SourceInstanceId,
    /// Subject, when known.
    pub subject: Option<SubjectId>,
}

impl ObjectContext {
    /// Returns metadata pairs suitable for object user metadata.
    #[must_use]
    pub fn metadata_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("project", self.project.to_string()),
            ("site", self.site.to_string()),
            ("source-instance", self.source_instance.to_string()),
        ];
        if let Some(subject) = &self.subject {
            pairs.push(("subject", subject.to_string()));
        }
        pairs
    }
}

// ============================================================================
// SECTION: Put Acknowledgement
// ============================================================================

/// Sink acknowledgement of a durable write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutAck {
    /// Key that now holds the payload.
    pub key: ObjectKey,
    /// SHA-256 digest of the stored payload.
    pub digest: String,
    /// False when an identical payload was already present.
    pub written: bool,
}

// ============================================================================
// SECTION: Tests
// ============================================================================
