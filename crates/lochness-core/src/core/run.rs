// crates/lochness-core/src/core/run.rs
// ============================================================================
// Module: Lochness Sync Runs
// Description: Records of individual synchronization attempts.
// Purpose: Provide the append-only run history surfaced to operators.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! A [`SyncRun`] is created `in_progress` when a run starts and written once
//! more when it completes. Completed runs are never modified.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::ExternalId;
use crate::core::identifiers::SourceInstanceId;
use crate::core::identifiers::SyncRunId;
use crate::core::time::Timestamp;
use crate::core::watermark::Watermark;

// ============================================================================
// SECTION: Outcome
// ============================================================================

/// Final (or current) outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Run is executing.
    InProgress,
    /// Every produced item was written and the checkpoint advanced.
    Succeeded,
    /// Run stopped on an error; checkpoint holds the last good watermark.
    Failed,
    /// Run was cancelled after advancing through the written prefix.
    Partial,
    /// Process died while the run was in progress.
    Abandoned,
}

impl RunOutcome {
    /// Returns the persisted label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Abandoned => "abandoned",
        }
    }

    /// Parses a persisted label.
    #[must_use]
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "in_progress" => Some(Self::InProgress),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    /// Returns true once the run can no longer change.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

// ============================================================================
// SECTION: Run Records
// ============================================================================

/// Item counters accumulated during a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Items produced by the source.
    pub fetched: u64,
    /// Items newly written by the sink.
    pub written: u64,
    /// Items the sink already held with identical content.
    pub unchanged: u64,
}

/// Structured failure detail for failed runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunErrorDetail {
    /// Error kind label (`transient`, `permanent`, `vault`, ...).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Item being processed when the failure happened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<ExternalId>,
    /// Attempts spent on the failing operation.
    pub attempts: u32,
}

/// One orchestration attempt for one data-source instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    /// Run identifier.
    pub id: SyncRunId,
    /// Instance being synchronized.
    pub instance: SourceInstanceId,
    /// Start time.
    pub started_at: Timestamp,
    /// Completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Timestamp>,
    /// Outcome.
    pub outcome: RunOutcome,
    /// Failure detail for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunErrorDetail>,
    /// Item counters.
    #[serde(default)]
    pub counters: RunCounters,
    /// Checkpoint reached when the run finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watermark: Option<Watermark>,
}

impl SyncRun {
    /// Creates an in-progress run record.
    #[must_use]
    pub fn start(instance: SourceInstanceId, started_at: Timestamp) -> Self {
        Self {
            id: SyncRunId::generate(),
            instance,
            started_at,
            finished_at: None,
            outcome: RunOutcome::InProgress,
            error: None,
            counters: RunCounters::default(),
            watermark: None,
        }
    }

    /// Returns the completed form of this run.
    #[must_use]
    pub fn finish(
        mut self,
        outcome: RunOutcome,
        finished_at: Timestamp,
        error: Option<RunErrorDetail>,
    ) -> Self {
        self.outcome = outcome;
        self.finished_at = Some(finished_at);
        self.error = error;
        self
    }
}
