//! Reconciliation and sync-run orchestration.

mod orchestrator;
mod reconciler;

pub use orchestrator::{spawn_poller, CacheEvent, RunHandle, RunPhase, RunStatus, SyncEngine};
pub use reconciler::{ReferenceIndex, SnapshotMode};
