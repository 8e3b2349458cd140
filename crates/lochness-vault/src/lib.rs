// crates/lochness-vault/src/lib.rs
// ============================================================================
// Module: Lochness Credential Vault
// Description: Encryption-at-rest store for connector credentials.
// Purpose: Derive the vault key once and encrypt, decrypt, and rotate credentials.
// Dependencies: lochness-core, argon2, chacha20poly1305
// ============================================================================

//! ## Overview
//! The vault derives a single key from the operator passphrase with
//! Argon2id, verifies it against a persisted known-answer probe, and keeps it
//! in memory only. Each credential version is sealed with ChaCha20-Poly1305
//! under a fresh nonce, with the instance reference and version bound as
//! associated data. Plaintext leaves the vault only as a scoped
//! [`lochness_core::Secret`].

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod crypto;
pub mod vault;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use crypto::ALGORITHM;
pub use vault::CredentialVersion;
pub use vault::Vault;
pub use vault::VaultError;
