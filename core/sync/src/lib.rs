//! CloudShelf sync engine.
//!
//! This crate moves host attachments to the remote store and keeps the two
//! sides consistent:
//! - Batch orchestration: candidate selection, atomic claims, verified upload
//! - Complete sync sessions draining every pending file in batches
//! - Reconciliation of drift between host records and remote copies
//! - Scheduling of manual, automatic and reconcile runs

pub mod context;
pub mod engine;
pub mod folders;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;

#[cfg(test)]
mod testing;

pub use context::SyncContext;
pub use engine::SyncEngine;
pub use folders::FolderResolver;
pub use orchestrator::{
    Orchestrator, SessionReport, SyncSummary, DEFAULT_BATCH_SIZE, DEFAULT_MANUAL_LIMIT,
};
pub use reconcile::{ReconcileConfig, ReconcileReport, Reconciler, DEFAULT_RECONCILE_LIMIT};
pub use scheduler::{Schedule, SyncRequest, SyncResponse, SyncScheduler, SyncSchedulerHandle};
