// crates/lochness-core/src/lib.rs
// ============================================================================
// Module: Lochness Core Library
// Description: Public API surface for the Lochness sync core.
// Purpose: Expose catalog types, progress tracking, and backend interfaces.
// Dependencies: crate::{core, interfaces, runtime}
// ============================================================================

//! ## Overview
//! Lochness core defines the data model shared by the credential vault, the
//! connectors, the checkpoint stores, and the sync orchestrator. It is
//! backend-agnostic: persistence and vendor APIs integrate through the traits
//! in [`interfaces`], and [`runtime`] ships in-memory store implementations
//! for tests and dry runs.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;
pub mod runtime;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use core::*;

pub use interfaces::CatalogError;
pub use interfaces::CatalogStore;
pub use interfaces::ChangeStream;
pub use interfaces::CheckpointError;
pub use interfaces::CheckpointStore;
pub use interfaces::ConnectorError;
pub use interfaces::CredentialRecordStore;
pub use interfaces::SinkConnector;
pub use interfaces::SourceConnector;
pub use interfaces::StoreError;
pub use interfaces::SyncRunStore;
pub use runtime::InMemoryStore;
