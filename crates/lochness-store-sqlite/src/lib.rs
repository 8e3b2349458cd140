// crates/lochness-store-sqlite/src/lib.rs
// ============================================================================
// Module: Lochness SQLite Store
// Description: Durable store backends using SQLite WAL.
// Purpose: Provide production persistence for checkpoints, runs, credentials, and catalog.
// Dependencies: lochness-core, rusqlite
// ============================================================================

//! ## Overview
//! This crate provides [`SqliteStore`], a single `SQLite` database that
//! implements every Lochness store interface. Writes run inside transactions
//! and, with the default `synchronous = FULL`, are durable before the call
//! returns. Database contents are treated as untrusted and validated on load.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod catalog;
mod checkpoints;
mod credentials;
mod runs;
pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::SqliteStore;
pub use store::SqliteStoreConfig;
pub use store::SqliteStoreError;
pub use store::SqliteStoreMode;
pub use store::SqliteSyncMode;
