// crates/lochness-vault/src/crypto.rs
// ============================================================================
// Module: Vault Cryptography
// Description: Argon2id key derivation and ChaCha20-Poly1305 sealing.
// Purpose: Isolate the cryptographic primitives used by the vault.
// Dependencies: argon2, chacha20poly1305, rand, zeroize
// ============================================================================

//! ## Overview
//! Key derivation uses Argon2id with caller-supplied cost parameters and a
//! 16-byte random salt. Sealing uses ChaCha20-Poly1305 with a random 12-byte
//! nonce per call; the 16-byte authentication tag is stored separately from
//! the ciphertext.

// ============================================================================
// SECTION: Imports
// ============================================================================

use argon2::Algorithm;
use argon2::Argon2;
use argon2::Params;
use argon2::Version;
use chacha20poly1305::ChaCha20Poly1305;
use chacha20poly1305::Key;
use chacha20poly1305::KeyInit;
use chacha20poly1305::Nonce;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::aead::Payload as AeadPayload;
use lochness_core::KdfParams;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Algorithm label stored with every sealed record.
pub const ALGORITHM: &str = "chacha20poly1305-argon2id-v1";
/// Salt length for key derivation.
pub const SALT_LEN: usize = 16;
/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;
/// Authentication tag length.
pub const TAG_LEN: usize = 16;
/// Derived key length.
pub const KEY_LEN: usize = 32;

// ============================================================================
// SECTION: Sealed Data
// ============================================================================

/// Output of [`VaultKey::seal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Random nonce.
    pub nonce: Vec<u8>,
    /// Ciphertext without the tag.
    pub ciphertext: Vec<u8>,
    /// Authentication tag.
    pub tag: Vec<u8>,
}

/// Cryptographic failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoFailure {
    /// Key derivation or cipher setup failed.
    Setup(String),
    /// Authentication failed or the record is structurally invalid.
    Authentication,
}

// ============================================================================
// SECTION: Vault Key
// ============================================================================

/// Derived symmetric key, zeroed on drop.
pub struct VaultKey(Zeroizing<[u8; KEY_LEN]>);

impl VaultKey {
    /// Derives a key from a passphrase with Argon2id.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoFailure::Setup`] for invalid parameters.
    pub fn derive(passphrase: &[u8], salt: &[u8], kdf: KdfParams) -> Result<Self, CryptoFailure> {
        let params = Params::new(kdf.memory_kib, kdf.iterations, kdf.parallelism, Some(KEY_LEN))
            .map_err(|err| CryptoFailure::Setup(format!("invalid argon2 params: {err}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        argon2
            .hash_password_into(passphrase, salt, key.as_mut_slice())
            .map_err(|err| CryptoFailure::Setup(format!("key derivation failed: {err}")))?;
        Ok(Self(key))
    }

    /// Encrypts `plaintext` with a fresh nonce, binding `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoFailure::Setup`] when the cipher rejects the input.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CryptoFailure> {
        let nonce = random_bytes::<NONCE_LEN>();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.0.as_slice()));
        let mut combined = cipher
            .encrypt(Nonce::from_slice(&nonce), AeadPayload { msg: plaintext, aad })
            .map_err(|err| CryptoFailure::Setup(format!("encryption failed: {err}")))?;
        let split = combined.len().saturating_sub(TAG_LEN);
        let tag = combined.split_off(split);
        Ok(Sealed {
            nonce: nonce.to_vec(),
            ciphertext: combined,
            tag,
        })
    }

    /// Decrypts and authenticates a sealed record.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoFailure::Authentication`] for tampered data, a wrong
    /// key, mismatched `aad`, or malformed lengths.
    pub fn open(&self, sealed: &Sealed, aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoFailure> {
        if sealed.nonce.len() != NONCE_LEN || sealed.tag.len() != TAG_LEN {
            return Err(CryptoFailure::Authentication);
        }
        let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_LEN);
        combined.extend_from_slice(&sealed.ciphertext);
        combined.extend_from_slice(&sealed.tag);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.0.as_slice()));
        cipher
            .decrypt(Nonce::from_slice(&sealed.nonce), AeadPayload { msg: &combined, aad })
            .map(Zeroizing::new)
            .map_err(|_| CryptoFailure::Authentication)
    }
}

/// Generates cryptographically secure random bytes.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

// ============================================================================
// SECTION: Tests
// ============================================================================
