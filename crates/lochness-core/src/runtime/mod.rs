// crates/lochness-core/src/runtime/mod.rs
// ============================================================================
// Module: Lochness Runtime Helpers
// Description: In-process implementations of the core store interfaces.
// Purpose: Support tests and dry runs without a database.
// Dependencies: crate::{core, interfaces}
// ============================================================================

// ============================================================================
// SECTION: Submodules
// ============================================================================

pub mod store;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use store::InMemoryStore;
