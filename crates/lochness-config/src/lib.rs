// crates/lochness-config/src/lib.rs
// ============================================================================
// Module: Lochness Config Library
// Description: Canonical config model and validation for lochness.toml.
// Purpose: Single source of truth for process configuration semantics.
// Dependencies: lochness-connectors, lochness-core, lochness-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `lochness-config` defines the configuration model for the Lochness sync
//! engine: database pragmas, vault passphrase and KDF parameters, sync and
//! scheduler tuning, event output, and connector options. Validation is
//! strict and fails closed.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
