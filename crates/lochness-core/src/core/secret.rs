// crates/lochness-core/src/core/secret.rs
// ============================================================================
// Module: Lochness Secret Handle
// Description: Scoped, zeroizing plaintext credential handle.
// Purpose: Carry decrypted credentials into a single connector call.
// Dependencies: zeroize, serde_json
// ============================================================================

//! ## Overview
//! A [`Secret`] holds decrypted credential bytes for the duration of one
//! connector call. It is neither `Clone` nor `Serialize`, its `Debug` output
//! is redacted, and its buffer is zeroed on drop. Credentials are JSON
//! objects; connectors read individual fields with [`Secret::field`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde_json::Value;
use thiserror::Error;
use zeroize::Zeroizing;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Credential content errors. Messages never include secret material.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SecretError {
    /// Credential bytes are not a JSON object.
    #[error("credential is not a JSON object")]
    NotJson,
    /// A required field is absent or not a non-empty string.
    #[error("credential field missing: {0}")]
    MissingField(String),
}

// ============================================================================
// SECTION: Secret
// ============================================================================

/// Decrypted credential bytes, zeroed on drop.
pub struct Secret(Zeroizing<Vec<u8>>);

impl Secret {
    /// Wraps plaintext credential bytes.
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Zeroizing::new(bytes))
    }

    /// Exposes the plaintext bytes.
    #[must_use]
    pub fn expose(&self) -> &[u8] {
        &self.0
    }

    /// Reads a required string field from a JSON credential.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError`] when the credential is not a JSON object or the
    /// field is missing or empty.
    pub fn field(&self, name: &str) -> Result<Zeroizing<String>, SecretError> {
        self.optional_field(name)?.ok_or_else(|| SecretError::MissingField(name.to_string()))
    }

    /// Reads an optional string field from a JSON credential.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NotJson`] when the credential is not a JSON object.
    pub fn optional_field(&self, name: &str) -> Result<Option<Zeroizing<String>>, SecretError> {
        let Ok(Value::Object(mut map)) = serde_json::from_slice::<Value>(&self.0) else {
            return Err(SecretError::NotJson);
        };
        match map.remove(name) {
            Some(Value::String(value)) if !value.is_empty() => Ok(Some(Zeroizing::new(value))),
            _ => Ok(None),
        }
    }

    /// Verifies that every listed field is present.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError`] naming the first missing field.
    pub fn require_fields(&self, names: &[&str]) -> Result<(), SecretError> {
        for name in names {
            self.field(name)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
