// crates/lochness-core/src/core/mod.rs
// ============================================================================
// Module: Lochness Core Types
// Description: Canonical catalog, progress, and run-history structures.
// Purpose: Provide stable, serializable types shared across Lochness crates.
// Dependencies: serde, time, zeroize
// ============================================================================

//! ## Overview
//! Core types describe what is synchronized (catalog entries and their typed
//! connector metadata), how far synchronization has progressed (watermarks
//! and checkpoints), and what happened (sync runs). They carry no I/O.

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod catalog;
pub mod change;
pub mod checkpoint;
pub mod credential;
pub mod identifiers;
pub mod run;
pub mod secret;
pub mod time;
pub mod watermark;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use catalog::AzureBlobMetadata;
pub use catalog::DataSinkInstance;
pub use catalog::DataSinkType;
pub use catalog::DataSourceInstance;
pub use catalog::DataSourceType;
pub use catalog::MemorySinkMetadata;
pub use catalog::MemorySourceMetadata;
pub use catalog::Project;
pub use catalog::RedcapMetadata;
pub use catalog::S3Metadata;
pub use catalog::SharepointMetadata;
pub use catalog::SinkMetadata;
pub use catalog::Site;
pub use catalog::SourceMetadata;
pub use catalog::Subject;
pub use catalog::XnatMetadata;
pub use change::ChangeItem;
pub use change::KeyError;
pub use change::ObjectContext;
pub use change::ObjectKey;
pub use change::Payload;
pub use change::PutAck;
pub use change::sha256_hex;
pub use checkpoint::InFlightLedger;
pub use checkpoint::LedgerEntry;
pub use checkpoint::LedgerState;
pub use credential::CredentialRecord;
pub use credential::CredentialRef;
pub use credential::KdfParams;
pub use credential::VaultMeta;
pub use identifiers::ConnectorType;
pub use identifiers::ExternalId;
pub use identifiers::InstanceRef;
pub use identifiers::ProjectId;
pub use identifiers::SinkInstanceId;
pub use identifiers::SiteId;
pub use identifiers::SourceInstanceId;
pub use identifiers::SubjectId;
pub use identifiers::SyncRunId;
pub use run::RunCounters;
pub use run::RunErrorDetail;
pub use run::RunOutcome;
pub use run::SyncRun;
pub use secret::Secret;
pub use secret::SecretError;
pub use time::Timestamp;
pub use watermark::Watermark;
pub use watermark::WatermarkParseError;
