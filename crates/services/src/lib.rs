#![forbid(unsafe_code)]

pub mod aggregator;
pub mod backoff;
pub mod error;
pub mod invalidation;
pub mod offline_queue;
pub mod progress_engine;
pub mod reconciler;

pub use progress_core::Clock;

pub use aggregator::{AggregateUpdate, ProgressAggregator};
pub use backoff::Backoff;
pub use error::{AggregatorError, EngineError, QueueError, SyncError};
pub use invalidation::{
    CacheBackend, CacheError, CacheInvalidationManager, CacheKey, InMemoryCache,
};
pub use offline_queue::OfflineQueue;
pub use progress_engine::ProgressEngine;
pub use reconciler::SyncReconciler;
