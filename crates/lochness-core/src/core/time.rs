// crates/lochness-core/src/core/time.rs
// ============================================================================
// Module: Lochness Time Model
// Description: Canonical timestamp representation for watermarks and runs.
// Purpose: Provide a totally ordered, serializable instant in unix milliseconds.
// Dependencies: serde, time
// ============================================================================

//! ## Overview
//! All persisted instants are unix epoch milliseconds. Connectors convert
//! vendor timestamps (RFC 3339, REDCap `YYYY-MM-DD HH:MM`) into [`Timestamp`]
//! at the edge so the rest of the system compares plain integers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use time::OffsetDateTime;
use time::PrimitiveDateTime;
use time::format_description::well_known::Rfc2822;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;

// ============================================================================
// SECTION: Timestamp
// ============================================================================

/// Unix epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Smallest representable timestamp.
    pub const MIN: Self = Self(i64::MIN);

    /// Creates a timestamp from unix milliseconds.
    #[must_use]
    pub const fn from_unix_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the unix milliseconds value.
    #[must_use]
    pub const fn as_unix_millis(self) -> i64 {
        self.0
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    /// Converts an offset date-time into a timestamp.
    #[must_use]
    pub fn from_datetime(value: OffsetDateTime) -> Self {
        let nanos = value.unix_timestamp_nanos() / 1_000_000;
        Self(i64::try_from(nanos).unwrap_or(if nanos < 0 { i64::MIN } else { i64::MAX }))
    }

    /// Parses an RFC 3339 timestamp (`2024-05-01T12:30:00Z`).
    ///
    /// # Errors
    ///
    /// Returns a description of the parse failure.
    pub fn parse_rfc3339(value: &str) -> Result<Self, String> {
        OffsetDateTime::parse(value, &Rfc3339)
            .map(Self::from_datetime)
            .map_err(|err| format!("invalid rfc3339 timestamp {value:?}: {err}"))
    }

    /// Parses a REDCap-style UTC timestamp (`2024-05-01 12:30` or with seconds).
    ///
    /// # Errors
    ///
    /// Returns a description of the parse failure.
    pub fn parse_naive_utc(value: &str) -> Result<Self, String> {
        let with_seconds = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        let minutes = format_description!("[year]-[month]-[day] [hour]:[minute]");
        let parsed = PrimitiveDateTime::parse(value, with_seconds)
            .or_else(|_| PrimitiveDateTime::parse(value, minutes))
            .map_err(|err| format!("invalid timestamp {value:?}: {err}"))?;
        Ok(Self::from_datetime(parsed.assume_utc()))
    }

    /// Parses an HTTP `Date` header value (`Wed, 01 May 2024 12:05:00 GMT`).
    ///
    /// # Errors
    ///
    /// Returns a description of the parse failure.
    pub fn parse_http_date(value: &str) -> Result<Self, String> {
        OffsetDateTime::parse(value.trim(), &Rfc2822)
            .map(Self::from_datetime)
            .map_err(|err| format!("invalid http date {value:?}: {err}"))
    }

    /// Rounds down to a whole multiple of `unit_millis`.
    #[must_use]
    pub const fn truncate(self, unit_millis: i64) -> Self {
        if unit_millis <= 0 {
            return self;
        }
        Self(self.0.saturating_sub(self.0.rem_euclid(unit_millis)))
    }

    /// Formats the timestamp as `YYYY-MM-DD HH:MM` in UTC, truncating seconds.
    #[must_use]
    pub fn format_minutes_utc(self) -> String {
        let Some(datetime) = self.to_datetime() else {
            return "1970-01-01 00:00".to_string();
        };
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]");
        datetime.format(format).unwrap_or_else(|_| "1970-01-01 00:00".to_string())
    }

    /// Formats the timestamp as RFC 3339.
    #[must_use]
    pub fn to_rfc3339(self) -> String {
        self.to_datetime()
            .and_then(|datetime| datetime.format(&Rfc3339).ok())
            .unwrap_or_else(|| self.0.to_string())
    }

    /// Converts into an offset date-time when in range.
    fn to_datetime(self) -> Option<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000_000).ok()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
