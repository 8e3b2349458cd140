// crates/lochness-sync/src/events.rs
// ============================================================================
// Module: Sync Events
// Description: Structured events emitted on orchestrator state transitions.
// Purpose: Feed logging and alerting without coupling to a pipeline.
// Dependencies: lochness-core, serde, serde_json, tracing
// ============================================================================

//! ## Overview
//! The orchestrator reports run lifecycle transitions as [`SyncEvent`]
//! records through a [`SyncEventSink`]. Events carry identifiers, counters,
//! and watermarks only; payloads and credentials never appear in them.
//! Sinks are infallible from the caller's view: a sink that cannot record an
//! event logs the failure and drops it.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use lochness_core::ExternalId;
use lochness_core::RunCounters;
use lochness_core::RunErrorDetail;
use lochness_core::RunOutcome;
use lochness_core::SourceInstanceId;
use lochness_core::SyncRunId;
use lochness_core::Timestamp;
use lochness_core::Watermark;
use serde::Serialize;
use tracing::error;
use tracing::info;
use tracing::warn;

// ============================================================================
// SECTION: Types
// ============================================================================

/// One orchestrator state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A run row was created and the stream is about to open.
    RunStarted {
        /// Run identifier.
        run_id: SyncRunId,
        /// Source instance.
        instance: SourceInstanceId,
    },
    /// The checkpoint moved forward.
    CheckpointAdvanced {
        /// Run identifier.
        run_id: SyncRunId,
        /// Source instance.
        instance: SourceInstanceId,
        /// New checkpoint.
        watermark: Watermark,
    },
    /// A failed operation will be attempted again after a delay.
    RetryScheduled {
        /// Run identifier.
        run_id: SyncRunId,
        /// Source instance.
        instance: SourceInstanceId,
        /// Operation label (`list_changes`, `next_item`, `put`).
        operation: &'static str,
        /// Attempt that failed (1-based).
        attempt: u32,
        /// Backoff before the next attempt.
        delay_ms: u64,
        /// Error kind label.
        error_kind: &'static str,
        /// Item involved, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        external_id: Option<ExternalId>,
    },
    /// The change stream was reopened from the checkpoint after cursor expiry.
    StreamRestarted {
        /// Run identifier.
        run_id: SyncRunId,
        /// Source instance.
        instance: SourceInstanceId,
        /// Restart count within the run.
        restart: u32,
    },
    /// The run completed as succeeded or partial.
    RunFinished {
        /// Run identifier.
        run_id: SyncRunId,
        /// Source instance.
        instance: SourceInstanceId,
        /// Outcome.
        outcome: RunOutcome,
        /// Item counters.
        counters: RunCounters,
        /// Checkpoint reached.
        #[serde(skip_serializing_if = "Option::is_none")]
        watermark: Option<Watermark>,
    },
    /// The run failed.
    RunFailed {
        /// Run identifier.
        run_id: SyncRunId,
        /// Source instance.
        instance: SourceInstanceId,
        /// Failure detail.
        error: RunErrorDetail,
        /// Item counters.
        counters: RunCounters,
        /// True when a store invariant was violated.
        invariant_violation: bool,
    },
}

impl SyncEvent {
    /// Returns the stable event label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::CheckpointAdvanced { .. } => "checkpoint_advanced",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::StreamRestarted { .. } => "stream_restarted",
            Self::RunFinished { .. } => "run_finished",
            Self::RunFailed { .. } => "run_failed",
        }
    }
}

/// Timestamped envelope written by [`JsonLinesEventSink`].
#[derive(Debug, Serialize)]
struct EventLine<'a> {
    /// Emission time (RFC 3339).
    at: String,
    /// Event body.
    #[serde(flatten)]
    event: &'a SyncEvent,
}

// ============================================================================
// SECTION: Trait
// ============================================================================

/// Receiver of orchestrator events.
pub trait SyncEventSink: Send + Sync {
    /// Records one event.
    fn emit(&self, event: &SyncEvent);
}

// ============================================================================
// SECTION: Sinks
// ============================================================================

/// Event sink that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl SyncEventSink for TracingEventSink {
    fn emit(&self, event: &SyncEvent) {
        match event {
            SyncEvent::RunStarted {
                run_id,
                instance,
            } => info!(%run_id, %instance, "sync run started"),
            SyncEvent::CheckpointAdvanced {
                run_id,
                instance,
                watermark,
            } => info!(%run_id, %instance, %watermark, "checkpoint advanced"),
            SyncEvent::RetryScheduled {
                run_id,
                instance,
                operation,
                attempt,
                delay_ms,
                error_kind,
                external_id,
            } => warn!(
                %run_id,
                %instance,
                operation,
                attempt,
                delay_ms,
                error_kind,
                external_id = external_id.as_ref().map(ExternalId::as_str),
                "retry scheduled"
            ),
            SyncEvent::StreamRestarted {
                run_id,
                instance,
                restart,
            } => warn!(%run_id, %instance, restart, "change stream restarted from checkpoint"),
            SyncEvent::RunFinished {
                run_id,
                instance,
                outcome,
                counters,
                watermark,
            } => info!(
                %run_id,
                %instance,
                outcome = outcome.as_str(),
                fetched = counters.fetched,
                written = counters.written,
                unchanged = counters.unchanged,
                watermark = watermark.as_ref().map(ToString::to_string),
                "sync run finished"
            ),
            SyncEvent::RunFailed {
                run_id,
                instance,
                error,
                counters,
                invariant_violation,
            } => error!(
                %run_id,
                %instance,
                kind = %error.kind,
                message = %error.message,
                external_id = error.external_id.as_ref().map(ExternalId::as_str),
                attempts = error.attempts,
                fetched = counters.fetched,
                written = counters.written,
                invariant_violation,
                "sync run failed"
            ),
        }
    }
}

/// Event sink that appends JSON lines to a file.
pub struct JsonLinesEventSink {
    /// File handle used for append-only logging.
    file: Mutex<File>,
}

impl JsonLinesEventSink {
    /// Opens the event log in append mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn new(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl SyncEventSink for JsonLinesEventSink {
    fn emit(&self, event: &SyncEvent) {
        let line = EventLine {
            at: Timestamp::now().to_rfc3339(),
            event,
        };
        let Ok(payload) = serde_json::to_string(&line) else {
            warn!(event = event.label(), "sync event could not be serialized");
            return;
        };
        let Ok(mut file) = self.file.lock() else {
            warn!(event = event.label(), "sync event log lock poisoned");
            return;
        };
        if let Err(err) = writeln!(file, "{payload}").and_then(|()| file.flush()) {
            warn!(event = event.label(), error = %err, "sync event write failed");
        }
        drop(file);
    }
}

/// No-op event sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

impl SyncEventSink for NoopEventSink {
    fn emit(&self, _event: &SyncEvent) {}
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::panic, clippy::unwrap_used, reason = "Test-only assertions.")]

    use std::fs;

    use serde_json::Value;

    use super::*;

    #[test]
    fn json_lines_are_appended_with_a_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonLinesEventSink::new(&path).unwrap();
        let run_id = SyncRunId::new("run-1");
        let instance = SourceInstanceId::new("redcap-1");
        sink.emit(&SyncEvent::RunStarted {
            run_id: run_id.clone(),
            instance: instance.clone(),
        });
        sink.emit(&SyncEvent::CheckpointAdvanced {
            run_id,
            instance,
            watermark: Watermark::at(Timestamp::from_unix_millis(2_000), ExternalId::new("2")),
        });

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "run_started");
        assert!(lines[0]["at"].as_str().is_some());
        assert_eq!(lines[1]["event"], "checkpoint_advanced");
        assert_eq!(lines[1]["watermark"], "2000:2");
    }
}
