// crates/lochness-connectors/src/lib.rs
// ============================================================================
// Module: Lochness Connectors
// Description: Source and sink connectors for the Lochness sync engine.
// Purpose: Implement vendor change listing and object storage behind core traits.
// Dependencies: lochness-core, reqwest, aws-sdk-s3
// ============================================================================

//! ## Overview
//! Sources ([`sources`]) list vendor changes after a watermark and fetch
//! content lazily; sinks ([`sinks`]) store payloads idempotently. The
//! [`registry::ConnectorRegistry`] maps catalog connector type names onto
//! the factories that build them.
//!
//! Credentials are never cached by connectors beyond a single stream; every
//! call receives the decrypted [`lochness_core::Secret`] from the caller.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod http;
pub mod registry;
pub mod sinks;
pub mod sources;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use http::HttpOptions;
pub use registry::ConnectorOptions;
pub use registry::ConnectorRegistry;
pub use registry::MemoryBackends;
pub use registry::RegistryError;
pub use registry::SinkFactory;
pub use registry::SourceFactory;
pub use sinks::AzureBlobSinkFactory;
pub use sinks::MemoryObjects;
pub use sinks::MemorySinkFactory;
pub use sinks::S3SinkFactory;
pub use sinks::StoredObject;
pub use sources::MemoryFeed;
pub use sources::MemoryFeeds;
pub use sources::MemorySourceFactory;
pub use sources::RedcapSourceFactory;
pub use sources::SharepointEndpoints;
pub use sources::SharepointSourceFactory;
pub use sources::XnatSourceFactory;
