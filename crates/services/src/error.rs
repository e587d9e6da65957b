//! Shared error types for the services crate.

use thiserror::Error;

use progress_core::model::ProgressError;
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Errors emitted by `ProgressAggregator`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AggregatorError {
    /// A recomputed rollup violated a count invariant and no previous
    /// known-good aggregate existed to fall back on.
    #[error(transparent)]
    Inconsistency(#[from] ProgressError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `SyncReconciler`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The batch did not finish inside its wall-clock budget. The client
    /// should treat the outcome as unknown and resubmit; idempotency makes
    /// the retry safe.
    #[error("batch ingest exceeded its time budget")]
    IngestTimeout,
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted by `OfflineQueue`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// Local storage is full of unacknowledged entries; nothing can be
    /// evicted without losing data. Surfaced to the user.
    #[error("offline queue is full of unacknowledged events")]
    QueueFull,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Errors emitted while bootstrapping or driving the engine facade.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}
