// crates/lochness-vault/src/vault.rs
// ============================================================================
// Module: Credential Vault
// Description: Store, retrieve, rotate, and acquire encrypted credentials.
// Purpose: Own the vault key lifecycle and the credential record contract.
// Dependencies: crate::crypto, lochness-core, tracing
// ============================================================================

//! ## Overview
//! [`Vault::unlock`] derives the key once per process. On first use it
//! generates the salt and persists a known-answer probe; afterwards a wrong
//! passphrase fails the probe with [`VaultError::BadPassphrase`]. The key is
//! dropped (and zeroed) together with the vault.
//!
//! Exactly one version per instance reference is active. Rotation inserts a
//! new active version and deactivates the previous one in the same store
//! transaction; old versions are kept for audit.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use lochness_core::CredentialRecord;
use lochness_core::CredentialRecordStore;
use lochness_core::CredentialRef;
use lochness_core::InstanceRef;
use lochness_core::KdfParams;
use lochness_core::Secret;
use lochness_core::StoreError;
use lochness_core::Timestamp;
use lochness_core::VaultMeta;
use thiserror::Error;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::crypto::ALGORITHM;
use crate::crypto::CryptoFailure;
use crate::crypto::SALT_LEN;
use crate::crypto::Sealed;
use crate::crypto::VaultKey;
use crate::crypto::random_bytes;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Plaintext of the known-answer probe.
const PROBE_PLAINTEXT: &[u8] = b"lochness vault known-answer probe v1";
/// Associated data of the known-answer probe.
const PROBE_AAD: &[u8] = b"lochness-vault-probe";

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Credential vault errors. Messages never contain plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// No credential exists for the reference.
    #[error("credential not found: {0}")]
    NotFound(String),
    /// Stored record failed authentication or is structurally invalid.
    #[error("credential record corrupt: {0}")]
    Corrupt(String),
    /// Passphrase does not match the persisted key probe.
    #[error("vault passphrase rejected")]
    BadPassphrase,
    /// An active credential already exists; rotate instead.
    #[error("credential already exists: {0}")]
    AlreadyExists(String),
    /// Cryptographic setup failure.
    #[error("vault crypto error: {0}")]
    Crypto(String),
    /// Backend failure.
    #[error("vault storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for VaultError {
    fn from(error: StoreError) -> Self {
        Self::Storage(error.to_string())
    }
}

impl From<CryptoFailure> for VaultError {
    fn from(error: CryptoFailure) -> Self {
        match error {
            CryptoFailure::Setup(message) => Self::Crypto(message),
            CryptoFailure::Authentication => Self::Corrupt("authentication failed".to_string()),
        }
    }
}

// ============================================================================
// SECTION: Version Metadata
// ============================================================================

/// Audit view of one stored credential version (no secret material).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialVersion {
    /// Version reference.
    pub reference: CredentialRef,
    /// True for the version connectors use.
    pub active: bool,
    /// Algorithm label.
    pub algorithm: String,
    /// Creation time.
    pub created_at: Timestamp,
}

// ============================================================================
// SECTION: Vault
// ============================================================================

/// Unlocked credential vault.
pub struct Vault {
    /// Ciphertext persistence.
    store: Arc<dyn CredentialRecordStore>,
    /// Derived key, zeroed on drop.
    key: VaultKey,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Vault { .. }")
    }
}

impl Vault {
    /// Derives the vault key and verifies it against the persisted probe.
    ///
    /// `kdf` is used only when the vault is initialized; existing vaults reuse
    /// their stored parameters.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::BadPassphrase`] when the probe fails to decrypt,
    /// [`VaultError::Crypto`] for invalid parameters, and
    /// [`VaultError::Storage`] on backend failure.
    pub fn unlock(
        store: Arc<dyn CredentialRecordStore>,
        passphrase: &[u8],
        kdf: KdfParams,
    ) -> Result<Self, VaultError> {
        if passphrase.is_empty() {
            return Err(VaultError::BadPassphrase);
        }
        if let Some(meta) = store.load_vault_meta()? {
            let key = verify_existing(&meta, passphrase)?;
            info!(algorithm = %meta.algorithm, "vault unlocked");
            return Ok(Self { store, key });
        }
        let salt = random_bytes::<SALT_LEN>();
        let key = VaultKey::derive(passphrase, &salt, kdf)?;
        let probe = key.seal(PROBE_PLAINTEXT, PROBE_AAD)?;
        let mut probe_ciphertext = probe.ciphertext;
        probe_ciphertext.extend_from_slice(&probe.tag);
        let meta = VaultMeta {
            salt: salt.to_vec(),
            kdf,
            algorithm: ALGORITHM.to_string(),
            probe_nonce: probe.nonce,
            probe_ciphertext,
            created_at: Timestamp::now(),
        };
        match store.init_vault_meta(&meta) {
            Ok(()) => {
                info!(algorithm = ALGORITHM, "vault initialized");
                Ok(Self { store, key })
            }
            Err(StoreError::Conflict(_)) => {
                warn!("vault initialized concurrently; verifying against stored metadata");
                let stored = store
                    .load_vault_meta()?
                    .ok_or_else(|| VaultError::Storage("vault metadata vanished".to_string()))?;
                let key = verify_existing(&stored, passphrase)?;
                Ok(Self { store, key })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Encrypts and stores the first version of a credential.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::AlreadyExists`] when the reference already has a
    /// credential; use [`Vault::rotate`] instead.
    pub fn store(
        &self,
        instance_ref: &InstanceRef,
        plaintext: &[u8],
    ) -> Result<CredentialRef, VaultError> {
        if !self.store.list_credentials(instance_ref)?.is_empty() {
            return Err(VaultError::AlreadyExists(instance_ref.to_string()));
        }
        let reference = self.insert_version(instance_ref, 1, plaintext).map_err(|err| match err {
            VaultError::Storage(_) if self.exists(instance_ref) => {
                VaultError::AlreadyExists(instance_ref.to_string())
            }
            other => other,
        })?;
        info!(instance_ref = %instance_ref, version = reference.version, "credential stored");
        Ok(reference)
    }

    /// Decrypts one credential version.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] when the version does not exist and
    /// [`VaultError::Corrupt`] when authentication fails.
    pub fn retrieve(&self, reference: &CredentialRef) -> Result<Secret, VaultError> {
        let record = self
            .store
            .load_credential(&reference.instance_ref, reference.version)?
            .ok_or_else(|| {
                VaultError::NotFound(format!("{} v{}", reference.instance_ref, reference.version))
            })?;
        self.decrypt(&record)
    }

    /// Stores a new active version, deactivating the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] when the reference has no credential yet.
    pub fn rotate(
        &self,
        instance_ref: &InstanceRef,
        plaintext: &[u8],
    ) -> Result<CredentialRef, VaultError> {
        let latest = self
            .store
            .list_credentials(instance_ref)?
            .iter()
            .map(|record| record.version)
            .max()
            .ok_or_else(|| VaultError::NotFound(instance_ref.to_string()))?;
        let next = latest
            .checked_add(1)
            .ok_or_else(|| VaultError::Corrupt(format!("version overflow for {instance_ref}")))?;
        let reference = self.insert_version(instance_ref, next, plaintext)?;
        info!(instance_ref = %instance_ref, version = reference.version, "credential rotated");
        Ok(reference)
    }

    /// Decrypts the active credential for a connector call.
    ///
    /// The returned [`Secret`] should be dropped as soon as the call returns.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] when no active version exists and
    /// [`VaultError::Corrupt`] when authentication fails.
    pub fn acquire(&self, instance_ref: &InstanceRef) -> Result<Secret, VaultError> {
        let record = self
            .store
            .load_active_credential(instance_ref)?
            .ok_or_else(|| VaultError::NotFound(instance_ref.to_string()))?;
        debug!(instance_ref = %instance_ref, version = record.version, "credential acquired");
        self.decrypt(&record)
    }

    /// Lists stored versions without decrypting them.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Storage`] on backend failure.
    pub fn versions(&self, instance_ref: &InstanceRef) -> Result<Vec<CredentialVersion>, VaultError> {
        Ok(self
            .store
            .list_credentials(instance_ref)?
            .into_iter()
            .map(|record| CredentialVersion {
                reference: record.reference(),
                active: record.active,
                algorithm: record.algorithm,
                created_at: record.created_at,
            })
            .collect())
    }

    /// Drops the vault, zeroing the derived key.
    pub fn close(self) {
        info!("vault closed");
    }

    /// Seals and inserts one version as the active one.
    fn insert_version(
        &self,
        instance_ref: &InstanceRef,
        version: u32,
        plaintext: &[u8],
    ) -> Result<CredentialRef, VaultError> {
        let sealed = self.key.seal(plaintext, &record_aad(instance_ref, version))?;
        let record = CredentialRecord {
            instance_ref: instance_ref.clone(),
            version,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
            tag: sealed.tag,
            algorithm: ALGORITHM.to_string(),
            active: true,
            created_at: Timestamp::now(),
        };
        self.store.insert_credential(&record)?;
        Ok(record.reference())
    }

    /// Authenticates and decrypts a record.
    fn decrypt(&self, record: &CredentialRecord) -> Result<Secret, VaultError> {
        if record.algorithm != ALGORITHM {
            return Err(VaultError::Corrupt(format!(
                "unsupported algorithm {} for {} v{}",
                record.algorithm, record.instance_ref, record.version
            )));
        }
        let sealed = Sealed {
            nonce: record.nonce.clone(),
            ciphertext: record.ciphertext.clone(),
            tag: record.tag.clone(),
        };
        let mut plaintext = self
            .key
            .open(&sealed, &record_aad(&record.instance_ref, record.version))
            .map_err(|_| {
                VaultError::Corrupt(format!(
                    "authentication failed for {} v{}",
                    record.instance_ref, record.version
                ))
            })?;
        Ok(Secret::new(std::mem::take(&mut *plaintext)))
    }

    /// Returns true when any version exists for the reference.
    fn exists(&self, instance_ref: &InstanceRef) -> bool {
        self.store.list_credentials(instance_ref).is_ok_and(|records| !records.is_empty())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Associated data binding a record to its reference and version.
fn record_aad(instance_ref: &InstanceRef, version: u32) -> Vec<u8> {
    format!("lochness-credential:{instance_ref}:{version}").into_bytes()
}

/// Re-derives the key from stored metadata and checks the probe.
fn verify_existing(meta: &VaultMeta, passphrase: &[u8]) -> Result<VaultKey, VaultError> {
    if meta.algorithm != ALGORITHM {
        return Err(VaultError::Corrupt(format!("unsupported vault algorithm {}", meta.algorithm)));
    }
    let key = VaultKey::derive(passphrase, &meta.salt, meta.kdf)?;
    let split = meta.probe_ciphertext.len().saturating_sub(crate::crypto::TAG_LEN);
    let sealed = Sealed {
        nonce: meta.probe_nonce.clone(),
        ciphertext: meta.probe_ciphertext[..split].to_vec(),
        tag: meta.probe_ciphertext[split..].to_vec(),
    };
    match key.open(&sealed, PROBE_AAD) {
        Ok(plaintext) if plaintext.as_slice() == PROBE_PLAINTEXT => Ok(key),
        _ => Err(VaultError::BadPassphrase),
    }
}
