// crates/lochness-connectors/src/sinks/mod.rs
// ============================================================================
// Module: Sink Connectors
// Description: S3, Azure Blob, and in-memory object sinks.
// Purpose: Store change payloads idempotently under derived object keys.
// Dependencies: lochness-core
// ============================================================================

//! ## Overview
//! Sinks store each payload under its object key with the catalog context
//! and a `sha256` digest as object metadata. When the stored digest already
//! matches, the write is skipped and acknowledged with `written = false`.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod azure;
mod memory;
mod s3;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use azure::AzureBlobSink;
pub use azure::AzureBlobSinkFactory;
pub use azure::AzureConnection;
pub use memory::MemoryObjects;
pub use memory::MemorySink;
pub use memory::MemorySinkFactory;
pub use memory::StoredObject;
pub use s3::S3Sink;
pub use s3::S3SinkFactory;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use lochness_core::ConnectorError;
use lochness_core::ConnectorType;
use lochness_core::DataSinkType;
use lochness_core::SinkMetadata;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Metadata key holding the payload digest.
pub(crate) const DIGEST_METADATA_KEY: &str = "sha256";

/// Returns the declared schema of a built-in sink type.
pub(crate) fn descriptor_named(name: &str) -> DataSinkType {
    SinkMetadata::descriptors()
        .into_iter()
        .find(|descriptor| descriptor.name.as_str() == name)
        .unwrap_or_else(|| DataSinkType {
            name: ConnectorType::new(name),
            fields: BTreeMap::new(),
        })
}

/// Error for an instance routed to the wrong factory.
pub(crate) fn wrong_metadata(expected: &str, found: &SinkMetadata) -> ConnectorError {
    ConnectorError::Permanent(format!(
        "{expected} factory received {} metadata",
        found.connector_type()
    ))
}
