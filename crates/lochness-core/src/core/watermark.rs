// crates/lochness-core/src/core/watermark.rs
// ============================================================================
// Module: Lochness Watermark
// Description: Opaque, totally ordered progress token for change streams.
// Purpose: Let the orchestrator compare progress without interpreting vendor cursors.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A [`Watermark`] marks how far a data-source instance has been
//! synchronized. It orders by produced-at time, then by external id, which
//! matches the order connectors must emit items in. The orchestrator only
//! compares watermarks and hands them back to connectors.
//!
//! The persisted form is `"<unix millis>:<external id>"`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;

use crate::core::identifiers::ExternalId;
use crate::core::time::Timestamp;

// ============================================================================
// SECTION: Watermark
// ============================================================================

/// Progress token through a source's change stream.
///
/// # Invariants
/// - Total order: `(produced_at, external_id)` compared lexicographically.
/// - [`Watermark::origin`] is less than or equal to every watermark.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Watermark {
    /// Production time of the last item covered.
    produced_at: Timestamp,
    /// External id of the last item covered (tie breaker).
    external_id: ExternalId,
}

impl Watermark {
    /// Returns the watermark preceding every item.
    #[must_use]
    pub fn origin() -> Self {
        Self {
            produced_at: Timestamp::MIN,
            external_id: ExternalId::new(""),
        }
    }

    /// Creates a watermark covering the given item position.
    #[must_use]
    pub const fn at(produced_at: Timestamp, external_id: ExternalId) -> Self {
        Self {
            produced_at,
            external_id,
        }
    }

    /// Returns true for the origin watermark.
    #[must_use]
    pub fn is_origin(&self) -> bool {
        *self == Self::origin()
    }

    /// Returns the produced-at component.
    #[must_use]
    pub const fn produced_at(&self) -> Timestamp {
        self.produced_at
    }

    /// Returns the external-id component.
    #[must_use]
    pub const fn external_id(&self) -> &ExternalId {
        &self.external_id
    }

    /// Returns true when an item at `(produced_at, external_id)` lies strictly after this mark.
    #[must_use]
    pub fn precedes(&self, produced_at: Timestamp, external_id: &ExternalId) -> bool {
        match self.produced_at.cmp(&produced_at) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => self.external_id < *external_id,
        }
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::origin()
    }
}

impl PartialOrd for Watermark {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Watermark {
    fn cmp(&self, other: &Self) -> Ordering {
        self.produced_at
            .cmp(&other.produced_at)
            .then_with(|| self.external_id.cmp(&other.external_id))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.produced_at.as_unix_millis(), self.external_id)
    }
}

// ============================================================================
// SECTION: Parsing
// ============================================================================

/// Watermark parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid watermark {0:?}")]
pub struct WatermarkParseError(pub String);

impl FromStr for Watermark {
    type Err = WatermarkParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((millis, external_id)) = value.split_once(':') else {
            return Err(WatermarkParseError(value.to_string()));
        };
        let millis: i64 = millis.parse().map_err(|_| WatermarkParseError(value.to_string()))?;
        Ok(Self::at(Timestamp::from_unix_millis(millis), ExternalId::new(external_id)))
    }
}

impl Serialize for Watermark {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Watermark {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, clippy::unwrap_used, reason = "Test-only assertions.")]

    use proptest::prelude::*;

    use super::Watermark;
    use crate::core::identifiers::ExternalId;
    use crate::core::time::Timestamp;

    fn mark(millis: i64, id: &str) -> Watermark {
        Watermark::at(Timestamp::from_unix_millis(millis), ExternalId::new(id))
    }

    #[test]
    fn orders_by_time_then_external_id() {
        assert!(mark(1, "b") < mark(2, "a"));
        assert!(mark(2, "a") < mark(2, "b"));
        assert!(Watermark::origin() < mark(i64::MIN, "a"));
    }

    #[test]
    fn precedes_is_strict() {
        let current = mark(10, "x");
        assert!(!current.precedes(Timestamp::from_unix_millis(10), &ExternalId::new("x")));
        assert!(current.precedes(Timestamp::from_unix_millis(10), &ExternalId::new("y")));
        assert!(!current.precedes(Timestamp::from_unix_millis(9), &ExternalId::new("z")));
    }

    #[test]
    fn external_ids_may_contain_colons() {
        let original = mark(1_700_000_000_000, "urn:xnat:E001");
        let parsed: Watermark = original.to_string().parse().unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn origin_survives_persistence() {
        let json = serde_json::to_string(&Watermark::origin()).unwrap();
        let parsed: Watermark = serde_json::from_str(&json).unwrap();
        assert!(parsed.is_origin());
    }

    proptest! {
        #[test]
        fn display_parse_preserves_order(a in any::<i64>(), b in any::<i64>(), x in "[a-z0-9:]{0,8}", y in "[a-z0-9:]{0,8}") {
            let left = mark(a, &x);
            let right = mark(b, &y);
            let left_parsed: Watermark = left.to_string().parse().unwrap();
            let right_parsed: Watermark = right.to_string().parse().unwrap();
            prop_assert_eq!(left.cmp(&right), left_parsed.cmp(&right_parsed));
        }
    }
}
