// crates/lochness-core/src/core/credential.rs
// ============================================================================
// Module: Lochness Credential Records
// Description: Encrypted credential records and vault key metadata.
// Purpose: Define what the vault persists; never plaintext.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Credential records hold ciphertext only. [`VaultMeta`] stores the key
//! derivation salt and parameters plus a known-answer probe used to verify the
//! operator passphrase at startup.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::InstanceRef;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Key Derivation Parameters
// ============================================================================

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Iteration count.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65_536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

// ============================================================================
// SECTION: Records
// ============================================================================

/// Reference to one credential version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialRef {
    /// Owning instance reference.
    pub instance_ref: InstanceRef,
    /// Version number (1-based, increasing on rotation).
    pub version: u32,
}

/// Persisted encrypted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    /// Owning instance reference.
    pub instance_ref: InstanceRef,
    /// Version number.
    pub version: u32,
    /// AEAD nonce.
    pub nonce: Vec<u8>,
    /// Ciphertext without the authentication tag.
    pub ciphertext: Vec<u8>,
    /// Authentication tag.
    pub tag: Vec<u8>,
    /// Algorithm label.
    pub algorithm: String,
    /// True for the single version used by connectors.
    pub active: bool,
    /// Creation time.
    pub created_at: Timestamp,
}

impl CredentialRecord {
    /// Returns the reference addressing this record.
    #[must_use]
    pub fn reference(&self) -> CredentialRef {
        CredentialRef {
            instance_ref: self.instance_ref.clone(),
            version: self.version,
        }
    }
}

/// Persisted vault key metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultMeta {
    /// Random key-derivation salt.
    pub salt: Vec<u8>,
    /// Key-derivation parameters used with the salt.
    pub kdf: KdfParams,
    /// Algorithm label.
    pub algorithm: String,
    /// Known-answer probe nonce.
    pub probe_nonce: Vec<u8>,
    /// Known-answer probe ciphertext including its tag.
    pub probe_ciphertext: Vec<u8>,
    /// Creation time.
    pub created_at: Timestamp,
}
