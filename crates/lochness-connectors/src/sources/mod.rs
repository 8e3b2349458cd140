// crates/lochness-connectors/src/sources/mod.rs
// ============================================================================
// Module: Source Connectors
// Description: REDCap, XNAT, SharePoint, and in-memory change sources.
// Purpose: Translate vendor listings into ordered change streams.
// Dependencies: lochness-core
// ============================================================================

//! ## Overview
//! Each source lists the items changed after a watermark, orders them by
//! `(produced_at, external_id)`, and fetches content lazily one item at a
//! time. A failed fetch leaves the pending item in place so the caller can
//! retry it.

// ============================================================================
// SECTION: Modules
// ============================================================================

mod memory;
mod redcap;
mod sharepoint;
mod xnat;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use memory::MemoryFeed;
pub use memory::MemoryFeeds;
pub use memory::MemorySource;
pub use memory::MemorySourceFactory;
pub use redcap::RedcapSource;
pub use redcap::RedcapSourceFactory;
pub use sharepoint::SharepointEndpoints;
pub use sharepoint::SharepointSource;
pub use sharepoint::SharepointSourceFactory;
pub use xnat::XnatSource;
pub use xnat::XnatSourceFactory;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use lochness_core::ConnectorError;
use lochness_core::ConnectorType;
use lochness_core::DataSourceType;
use lochness_core::ExternalId;
use lochness_core::SourceMetadata;
use lochness_core::Timestamp;
use lochness_core::Watermark;

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Returns the declared schema of a built-in source type.
pub(crate) fn descriptor_named(name: &str) -> DataSourceType {
    SourceMetadata::descriptors()
        .into_iter()
        .find(|descriptor| descriptor.name.as_str() == name)
        .unwrap_or_else(|| DataSourceType {
            name: ConnectorType::new(name),
            fields: BTreeMap::new(),
        })
}

/// Error for an instance routed to the wrong factory.
pub(crate) fn wrong_metadata(expected: &str, found: &SourceMetadata) -> ConnectorError {
    ConnectorError::Permanent(format!(
        "{expected} factory received {} metadata",
        found.connector_type()
    ))
}

/// Keeps entries strictly after `since` and sorts them into stream order.
pub(crate) fn order_after<T>(
    since: &Watermark,
    entries: Vec<(Timestamp, ExternalId, T)>,
) -> Vec<(Timestamp, ExternalId, T)> {
    let mut kept: Vec<_> = entries
        .into_iter()
        .filter(|(produced_at, external_id, _)| since.precedes(*produced_at, external_id))
        .collect();
    kept.sort_by(|left, right| (left.0, &left.1).cmp(&(right.0, &right.1)));
    kept
}

/// Drops entries stamped in the clock unit that contains `server_now`.
///
/// Vendors that stamp changes at `unit_millis` granularity can still add
/// entries to the open unit, so those wait for a later listing.
pub(crate) fn settled_before<T>(
    entries: Vec<(Timestamp, ExternalId, T)>,
    server_now: Timestamp,
    unit_millis: i64,
) -> Vec<(Timestamp, ExternalId, T)> {
    let open_from = server_now.truncate(unit_millis);
    entries.into_iter().filter(|(produced_at, _, _)| *produced_at < open_from).collect()
}

// ============================================================================
// SECTION: Tests
// ============================================================================
