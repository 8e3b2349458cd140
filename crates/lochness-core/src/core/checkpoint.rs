// crates/lochness-core/src/core/checkpoint.rs
// ============================================================================
// Module: Lochness Checkpoint Ledger
// Description: In-flight ledger of fetched items awaiting durable writes.
// Purpose: Decide how far the checkpoint may safely advance.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! The ledger records every item fetched in the current run together with its
//! write state. The checkpoint may only advance to the last watermark of the
//! contiguous prefix of written entries: an unconfirmed item anywhere blocks
//! advancement past it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;

use serde::Deserialize;
use serde::Serialize;

use crate::core::change::ObjectKey;
use crate::core::watermark::Watermark;

// ============================================================================
// SECTION: Ledger Entries
// ============================================================================

/// Write state of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerState {
    /// Item fetched; the sink has not acknowledged it yet.
    Fetched,
    /// Sink acknowledged a durable write.
    Written,
}

impl LedgerState {
    /// Returns the persisted label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Fetched => "fetched",
            Self::Written => "written",
        }
    }

    /// Parses a persisted label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "fetched" => Some(Self::Fetched),
            "written" => Some(Self::Written),
            _ => None,
        }
    }
}

/// One fetched item tracked until its write is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Watermark of the item.
    pub watermark: Watermark,
    /// Sink key the item is written to.
    pub key: ObjectKey,
    /// Current write state.
    pub state: LedgerState,
}

// ============================================================================
// SECTION: In-Flight Ledger
// ============================================================================

/// Ordered ledger of the current run's fetched items.
///
/// # Invariants
/// - Entries are appended in strictly increasing watermark order.
#[derive(Debug, Default, Clone)]
pub struct InFlightLedger {
    /// Entries in fetch order.
    entries: VecDeque<LedgerEntry>,
}

impl InFlightLedger {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a freshly fetched entry.
    ///
    /// Returns false (and ignores the entry) when it is not strictly after the
    /// last recorded entry.
    pub fn push_fetched(&mut self, watermark: Watermark, key: ObjectKey) -> bool {
        if let Some(last) = self.entries.back()
            && last.watermark >= watermark
        {
            return false;
        }
        self.entries.push_back(LedgerEntry {
            watermark,
            key,
            state: LedgerState::Fetched,
        });
        true
    }

    /// Marks the entry with the given watermark as written.
    ///
    /// Returns the updated entry when found.
    pub fn mark_written(&mut self, watermark: &Watermark) -> Option<&LedgerEntry> {
        let entry = self.entries.iter_mut().find(|entry| entry.watermark == *watermark)?;
        entry.state = LedgerState::Written;
        Some(entry)
    }

    /// Returns the last watermark of the contiguous written prefix.
    #[must_use]
    pub fn advanceable(&self) -> Option<Watermark> {
        self.entries
            .iter()
            .take_while(|entry| entry.state == LedgerState::Written)
            .last()
            .map(|entry| entry.watermark.clone())
    }

    /// Drops every entry at or below `watermark`.
    pub fn drain_through(&mut self, watermark: &Watermark) {
        while let Some(front) = self.entries.front() {
            if front.watermark <= *watermark {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Returns the number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the tracked entries in fetch order.
    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter()
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================
