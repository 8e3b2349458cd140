// crates/lochness-core/src/core/identifiers.rs
// ============================================================================
// Module: Lochness Identifiers
// Description: Canonical opaque identifiers for catalog entries and runs.
// Purpose: Provide strongly typed, serializable identifiers with stable wire forms.
// Dependencies: serde, uuid
// ============================================================================

//! ## Overview
//! This module defines the identifiers used throughout Lochness. Identifiers
//! are opaque UTF-8 strings that serialize transparently. No normalization is
//! applied; validation of identifiers used in object keys happens in
//! [`crate::core::change::ObjectKey`].

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Identifier Macro
// ============================================================================

/// Declares a transparent string identifier newtype.
macro_rules! string_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

// ============================================================================
// SECTION: Identifier Types
// ============================================================================

string_identifier!(
    /// Research project identifier (for example `Pronet`).
    ProjectId
);

string_identifier!(
    /// Site identifier scoped within a project.
    SiteId
);

string_identifier!(
    /// Subject identifier scoped within a site.
    SubjectId
);

string_identifier!(
    /// Data-source instance identifier.
    SourceInstanceId
);

string_identifier!(
    /// Data-sink instance identifier.
    SinkInstanceId
);

string_identifier!(
    /// Source-assigned identifier of a single changed item.
    ///
    /// # Invariants
    /// - Stable across redelivery: the same upstream item always carries the
    ///   same external id.
    ExternalId
);

string_identifier!(
    /// Reference used to look up an instance's credential in the vault.
    InstanceRef
);

string_identifier!(
    /// Connector type name (`redcap`, `s3`, ...) keying the registry.
    ConnectorType
);

string_identifier!(
    /// Sync run identifier.
    SyncRunId
);

impl SyncRunId {
    /// Generates a fresh random run identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}
