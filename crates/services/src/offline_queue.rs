use std::sync::Arc;

use tracing::{debug, info};

use progress_core::model::{BatchId, ProgressEvent, SyncBatch, SyncResult};
use storage::repository::QueueRepository;

use crate::error::QueueError;

/// Client-resident durable queue of not-yet-acknowledged events.
///
/// Events are appended with monotonically increasing local sequence numbers
/// while the device is offline and removed only after the server acknowledges
/// their batch. Nothing is ever dropped silently: at capacity, the oldest
/// *acknowledged* entries are purged first, and if none exist the enqueue
/// fails with `QueueFull` for the caller to surface.
pub struct OfflineQueue {
    repo: Arc<dyn QueueRepository>,
    capacity: usize,
}

impl OfflineQueue {
    #[must_use]
    pub fn new(repo: Arc<dyn QueueRepository>, capacity: usize) -> Self {
        Self { repo, capacity }
    }

    /// Persist an event under the next local sequence number.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::QueueFull` when the queue is at capacity and
    /// holds no acknowledged entries to evict, and `QueueError::Storage` for
    /// local storage failures.
    pub async fn enqueue(&self, event: ProgressEvent) -> Result<u64, QueueError> {
        let len = self.repo.len().await?;
        if len >= self.capacity {
            let excess = len - self.capacity + 1;
            let purged = self.repo.purge_oldest_acked(excess).await?;
            if purged == 0 {
                return Err(QueueError::QueueFull);
            }
            debug!(purged, "evicted acknowledged queue entries to make room");
        }
        Ok(self.repo.push_event(&event).await?)
    }

    /// Assemble the next batch to submit, or `None` when nothing is pending.
    ///
    /// Entries already drained into an unacknowledged batch are returned
    /// again under the same batch id, so a resubmission after a timeout hits
    /// the server's dedup window instead of double-applying. Events enqueued
    /// after a drain wait for the next batch.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` for local storage failures.
    pub async fn drain(&self) -> Result<Option<SyncBatch>, QueueError> {
        let pending = self.repo.unacked().await?;
        let Some(first) = pending.first() else {
            return Ok(None);
        };

        let batch_id = match first.batch_id {
            Some(existing) => existing,
            None => {
                let fresh = BatchId::random();
                self.repo.assign_batch(fresh).await?;
                fresh
            }
        };

        let events: Vec<ProgressEvent> = self
            .repo
            .unacked()
            .await?
            .into_iter()
            .filter(|entry| entry.batch_id == Some(batch_id))
            .map(|entry| entry.event)
            .collect();

        let user_id = match events.first() {
            Some(event) => event.user_id(),
            None => return Ok(None),
        };

        debug!(batch = %batch_id, events = events.len(), "drained offline batch");
        Ok(Some(SyncBatch::new(batch_id, user_id, events)))
    }

    /// Mark a batch acknowledged after the server returned its result.
    ///
    /// Rejected events are acknowledged too: they are preserved in the
    /// server-side dead-letter set, and resubmitting them would only reject
    /// again.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` for local storage failures.
    pub async fn acknowledge(
        &self,
        batch_id: BatchId,
        result: &SyncResult,
    ) -> Result<usize, QueueError> {
        let acked = self.repo.mark_acked(batch_id).await?;
        info!(
            batch = %batch_id,
            acked,
            accepted = result.accepted.len(),
            duplicates = result.duplicates.len(),
            rejected = result.rejected.len(),
            "batch acknowledged"
        );
        Ok(acked)
    }

    /// Entries currently held, acknowledged or not.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Storage` for local storage failures.
    pub async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.repo.len().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progress_core::model::{
        CourseId, EventId, EventKind, LessonId, SectionId, UserId,
    };
    use progress_core::time::fixed_now;
    use storage::repository::InMemoryRepository;

    fn build_event(section: u64) -> ProgressEvent {
        ProgressEvent::new(
            EventId::random(),
            UserId::new(1),
            SectionId::new(section),
            LessonId::new(1),
            CourseId::new(1),
            EventKind::Completed,
            fixed_now(),
        )
        .unwrap()
    }

    fn queue(repo: &InMemoryRepository, capacity: usize) -> OfflineQueue {
        OfflineQueue::new(Arc::new(repo.clone()), capacity)
    }

    #[tokio::test]
    async fn drain_returns_pending_events_in_order() {
        let repo = InMemoryRepository::new();
        let queue = queue(&repo, 16);

        let first = build_event(10);
        let second = build_event(11);
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let batch = queue.drain().await.unwrap().expect("pending batch");
        assert_eq!(batch.events, vec![first, second]);
        assert_eq!(batch.user_id, UserId::new(1));
    }

    #[tokio::test]
    async fn redrain_reuses_the_same_batch_id() {
        let repo = InMemoryRepository::new();
        let queue = queue(&repo, 16);
        queue.enqueue(build_event(10)).await.unwrap();

        let first = queue.drain().await.unwrap().unwrap();
        // New events after the drain wait for the next batch.
        queue.enqueue(build_event(11)).await.unwrap();
        let second = queue.drain().await.unwrap().unwrap();

        assert_eq!(first.batch_id, second.batch_id);
        assert_eq!(first.events, second.events);
        assert_eq!(second.len(), 1);
    }

    #[tokio::test]
    async fn acknowledged_batches_leave_the_queue() {
        let repo = InMemoryRepository::new();
        let queue = queue(&repo, 16);
        queue.enqueue(build_event(10)).await.unwrap();
        let later = build_event(11);

        let batch = queue.drain().await.unwrap().unwrap();
        queue.enqueue(later.clone()).await.unwrap();
        queue
            .acknowledge(batch.batch_id, &SyncResult::new())
            .await
            .unwrap();

        let next = queue.drain().await.unwrap().unwrap();
        assert_ne!(next.batch_id, batch.batch_id);
        assert_eq!(next.events, vec![later]);
    }

    #[tokio::test]
    async fn full_queue_evicts_acked_before_failing() {
        let repo = InMemoryRepository::new();
        let queue = queue(&repo, 2);

        queue.enqueue(build_event(10)).await.unwrap();
        queue.enqueue(build_event(11)).await.unwrap();

        // No acknowledged entries yet: enqueue must fail loudly.
        let err = queue.enqueue(build_event(12)).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull));

        // Once a batch is acknowledged, its entries become evictable.
        let batch = queue.drain().await.unwrap().unwrap();
        queue
            .acknowledge(batch.batch_id, &SyncResult::new())
            .await
            .unwrap();
        queue.enqueue(build_event(12)).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }
}
