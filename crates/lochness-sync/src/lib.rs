// crates/lochness-sync/src/lib.rs
// ============================================================================
// Module: Lochness Sync Library
// Description: Incremental sync engine from research sources into storage.
// Purpose: Expose the orchestrator, scheduler, retry policy, and events.
// Dependencies: lochness-config, lochness-connectors, lochness-core, lochness-vault
// ============================================================================

//! ## Overview
//! Lochness sync moves changed records from source connectors into sink
//! connectors. Progress is tracked per source instance with a monotonic
//! checkpoint so an interrupted run resumes where the last confirmed write
//! left off.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod events;
pub mod orchestrator;
pub mod retry;
pub mod scheduler;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use events::JsonLinesEventSink;
pub use events::NoopEventSink;
pub use events::SyncEvent;
pub use events::SyncEventSink;
pub use events::TracingEventSink;
pub use orchestrator::Orchestrator;
pub use orchestrator::SyncError;
pub use orchestrator::SyncServices;
pub use orchestrator::SyncSettings;
pub use retry::RetryPolicy;
pub use scheduler::Scheduler;
pub use scheduler::SchedulerError;
