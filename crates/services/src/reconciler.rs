use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use progress_core::Clock;
use progress_core::hierarchy::ContentHierarchy;
use progress_core::model::{
    CourseId, EngineSettings, LessonId, ProgressEvent, RejectReason, SectionId, SyncBatch,
    SyncResult, UserId,
};
use storage::repository::{
    BatchLedger, DeadLetter, DeadLetterReason, DeadLetterRepository, EventStore, StorageError,
};

use crate::aggregator::ProgressAggregator;
use crate::backoff::Backoff;
use crate::error::SyncError;
use crate::invalidation::CacheInvalidationManager;

/// Lifecycle of a batch inside `ingest`, traced per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchPhase {
    Received,
    Validating,
    Ingesting,
    Aggregating,
    Acknowledged,
}

impl BatchPhase {
    fn as_str(self) -> &'static str {
        match self {
            BatchPhase::Received => "received",
            BatchPhase::Validating => "validating",
            BatchPhase::Ingesting => "ingesting",
            BatchPhase::Aggregating => "aggregating",
            BatchPhase::Acknowledged => "acknowledged",
        }
    }
}

/// Merges client-submitted batches into the event store.
///
/// Applies batch- and event-level idempotency, per-event validation, and
/// invokes the aggregator once per distinct touched stream. Partial success
/// is the normal case: a rejected event never fails its batch, and nothing
/// ever rolls back already-durable appends.
pub struct SyncReconciler {
    events: Arc<dyn EventStore>,
    batches: Arc<dyn BatchLedger>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    hierarchy: Arc<dyn ContentHierarchy>,
    aggregator: Arc<ProgressAggregator>,
    invalidation: Arc<CacheInvalidationManager>,
    clock: Clock,
    settings: EngineSettings,
}

impl SyncReconciler {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: Arc<dyn EventStore>,
        batches: Arc<dyn BatchLedger>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        hierarchy: Arc<dyn ContentHierarchy>,
        aggregator: Arc<ProgressAggregator>,
        invalidation: Arc<CacheInvalidationManager>,
        clock: Clock,
        settings: EngineSettings,
    ) -> Self {
        Self {
            events,
            batches,
            dead_letters,
            hierarchy,
            aggregator,
            invalidation,
            clock,
            settings,
        }
    }

    /// Ingest a sync batch under the configured wall-clock budget.
    ///
    /// Resubmitting a batch id still inside the dedup window returns the
    /// cached result without re-processing, so clients may retry after an
    /// unknown outcome.
    ///
    /// # Errors
    ///
    /// Returns `SyncError::IngestTimeout` when the budget expires (the
    /// client should resubmit; appends already made are durable and will
    /// deduplicate) and `SyncError::Storage` when the store stays
    /// unavailable past the retry budget.
    pub async fn ingest(&self, batch: SyncBatch) -> Result<SyncResult, SyncError> {
        match tokio::time::timeout(self.settings.ingest_timeout(), self.ingest_inner(batch)).await
        {
            Ok(result) => result,
            Err(_) => Err(SyncError::IngestTimeout),
        }
    }

    async fn ingest_inner(&self, batch: SyncBatch) -> Result<SyncResult, SyncError> {
        let batch_id = batch.batch_id;
        self.trace_phase(&batch, BatchPhase::Received);

        if let Some(cached) = self.batches.lookup_batch(batch_id).await? {
            info!(batch = %batch_id, "batch id already processed, replaying cached result");
            return Ok(cached);
        }

        self.trace_phase(&batch, BatchPhase::Validating);
        let mut result = SyncResult::new();
        let mut valid = Vec::with_capacity(batch.events.len());
        for event in &batch.events {
            match self.validate(event) {
                None => valid.push(event),
                Some(reason) => {
                    warn!(
                        batch = %batch_id,
                        event = %event.event_id(),
                        %reason,
                        "event rejected, held for manual review"
                    );
                    self.dead_letter(event, reason).await?;
                    result.rejected.push((event.event_id(), reason));
                }
            }
        }

        self.trace_phase(&batch, BatchPhase::Ingesting);
        let mut touched: BTreeSet<(UserId, SectionId)> = BTreeSet::new();
        for event in valid {
            let outcome = self.append_with_retry(event).await?;
            if outcome {
                result.accepted.push(event.event_id());
                touched.insert(event.stream());
            } else {
                result.duplicates.push(event.event_id());
            }
        }

        self.trace_phase(&batch, BatchPhase::Aggregating);
        // One recompute per distinct stream, not per event; lesson and
        // course notifications dedup the same way.
        let mut lessons: BTreeMap<(UserId, LessonId), _> = BTreeMap::new();
        let mut courses: BTreeMap<(UserId, CourseId), _> = BTreeMap::new();
        for (user_id, section_id) in touched {
            let update = self.aggregator.recompute_stream(user_id, section_id).await?;
            if let Some(lesson) = update.lesson {
                lessons.insert((user_id, lesson.lesson_id()), lesson);
            }
            if let Some(course) = update.course {
                courses.insert((user_id, course.course_id()), course);
            }
        }
        for lesson in lessons.values() {
            self.invalidation.on_lesson_updated(lesson).await;
        }
        for course in courses.values() {
            self.invalidation.on_course_updated(course).await;
        }

        self.batches
            .record_batch(
                batch_id,
                batch.user_id,
                &result,
                self.clock.now(),
                self.settings.dedup_window(),
            )
            .await?;

        self.trace_phase(&batch, BatchPhase::Acknowledged);
        info!(
            batch = %batch_id,
            accepted = result.accepted.len(),
            duplicates = result.duplicates.len(),
            rejected = result.rejected.len(),
            "batch acknowledged"
        );
        Ok(result)
    }

    /// `None` means the event is valid; `Some` carries the rejection.
    fn validate(&self, event: &ProgressEvent) -> Option<RejectReason> {
        let Some(parents) = self.hierarchy.section_parents(event.section_id()) else {
            return Some(RejectReason::UnknownReference);
        };
        // An event whose claimed parents disagree with the hierarchy is as
        // unreliable as one referencing nothing.
        if parents.lesson_id != event.lesson_id() || parents.course_id != event.course_id() {
            return Some(RejectReason::UnknownReference);
        }

        let horizon = self.clock.now() + self.settings.clock_skew_allowance();
        if event.client_timestamp() > horizon {
            return Some(RejectReason::ClockSkew);
        }

        None
    }

    async fn dead_letter(
        &self,
        event: &ProgressEvent,
        reason: RejectReason,
    ) -> Result<(), StorageError> {
        let (reason, detail) = match reason {
            RejectReason::UnknownReference => (
                DeadLetterReason::UnknownReference,
                format!(
                    "section {} / lesson {} / course {} not in content hierarchy",
                    event.section_id(),
                    event.lesson_id(),
                    event.course_id(),
                ),
            ),
            RejectReason::ClockSkew => (
                DeadLetterReason::ClockSkew,
                format!(
                    "client timestamp {} beyond skew allowance",
                    event.client_timestamp()
                ),
            ),
        };
        self.dead_letters
            .push_letter(&DeadLetter {
                event_id: event.event_id(),
                user_id: event.user_id(),
                reason,
                detail,
                recorded_at: self.clock.now(),
            })
            .await
    }

    /// Append, retrying transient store failures with backoff. Returns
    /// whether the event was newly appended (vs a duplicate).
    async fn append_with_retry(&self, event: &ProgressEvent) -> Result<bool, SyncError> {
        let mut backoff = Backoff::new(
            self.settings.retry_base_delay(),
            self.settings.append_max_retries(),
        );
        loop {
            match self.events.append(event).await {
                Ok(outcome) => return Ok(outcome.newly_appended),
                Err(StorageError::Unavailable(detail)) => match backoff.next_delay() {
                    Some(delay) => {
                        debug!(
                            event = %event.event_id(),
                            attempt = backoff.attempts(),
                            %detail,
                            "store unavailable, retrying append"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(SyncError::Storage(StorageError::Unavailable(detail))),
                },
                Err(other) => return Err(SyncError::Storage(other)),
            }
        }
    }

    fn trace_phase(&self, batch: &SyncBatch, phase: BatchPhase) {
        debug!(
            batch = %batch.batch_id,
            user = %batch.user_id,
            events = batch.len(),
            phase = phase.as_str(),
            "batch phase"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use progress_core::hierarchy::InMemoryHierarchy;
    use progress_core::model::{BatchId, EventId, EventKind};
    use progress_core::time::{fixed_clock, fixed_now};
    use storage::repository::{AggregateRepository, InMemoryRepository};

    use crate::invalidation::InMemoryCache;

    fn user() -> UserId {
        UserId::new(1)
    }

    fn hierarchy() -> Arc<InMemoryHierarchy> {
        Arc::new(
            InMemoryHierarchy::new()
                .with_lesson(CourseId::new(1), LessonId::new(10), &[
                    SectionId::new(100),
                    SectionId::new(101),
                ])
                .with_lesson(CourseId::new(1), LessonId::new(11), &[
                    SectionId::new(102),
                    SectionId::new(103),
                ]),
        )
    }

    fn reconciler(repo: &InMemoryRepository, cache: Arc<InMemoryCache>) -> SyncReconciler {
        let hierarchy = hierarchy();
        let aggregator = Arc::new(
            ProgressAggregator::new(
                Arc::new(repo.clone()),
                Arc::new(repo.clone()),
                Arc::new(repo.clone()),
                Arc::clone(&hierarchy) as Arc<dyn ContentHierarchy>,
            )
            .with_clock(fixed_clock()),
        );
        let invalidation = Arc::new(CacheInvalidationManager::new(
            cache,
            EngineSettings::default(),
        ));
        SyncReconciler::new(
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            hierarchy,
            aggregator,
            invalidation,
            fixed_clock(),
            EngineSettings::default(),
        )
    }

    fn completed(section: u64) -> ProgressEvent {
        ProgressEvent::new(
            EventId::random(),
            user(),
            SectionId::new(section),
            LessonId::new(if section <= 101 { 10 } else { 11 }),
            CourseId::new(1),
            EventKind::Completed,
            fixed_now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn partial_batch_success_rejects_only_the_bad_event() {
        let repo = InMemoryRepository::new();
        let reconciler = reconciler(&repo, Arc::new(InMemoryCache::new()));

        let mut events: Vec<_> = (0_u64..9)
            .map(|i| {
                // Spread nine valid events across the four known sections.
                completed(100 + (i % 4))
            })
            .collect();
        let unknown = ProgressEvent::new(
            EventId::random(),
            user(),
            SectionId::new(999),
            LessonId::new(10),
            CourseId::new(1),
            EventKind::Completed,
            fixed_now(),
        )
        .unwrap();
        events.push(unknown.clone());

        let result = reconciler
            .ingest(SyncBatch::new(BatchId::random(), user(), events))
            .await
            .unwrap();

        assert_eq!(result.accepted.len(), 9);
        assert_eq!(result.duplicates.len(), 0);
        assert_eq!(result.rejected, vec![(
            unknown.event_id(),
            RejectReason::UnknownReference
        )]);

        // The rejected event never reached the store, only the dead-letter
        // set.
        assert!(
            repo.read_stream(user(), SectionId::new(999))
                .await
                .unwrap()
                .is_empty()
        );
        let letters = repo.letters_for_user(user()).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::UnknownReference);

        // Aggregates exist only for the sections among the accepted nine.
        for section in [100, 101, 102, 103] {
            assert!(
                repo.get_section(user(), SectionId::new(section))
                    .await
                    .unwrap()
                    .is_some()
            );
        }
        assert!(
            repo.get_section(user(), SectionId::new(999))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn replayed_batch_id_returns_cached_result() {
        let repo = InMemoryRepository::new();
        let cache = Arc::new(InMemoryCache::new());
        let reconciler = reconciler(&repo, Arc::clone(&cache));

        let batch = SyncBatch::new(BatchId::random(), user(), vec![completed(100)]);
        let first = reconciler.ingest(batch.clone()).await.unwrap();
        let evictions_after_first = cache.evictions().len();

        let replay = reconciler.ingest(batch).await.unwrap();
        assert_eq!(replay, first);
        // The replay is served from the ledger: no re-aggregation, no new
        // invalidations.
        assert_eq!(cache.evictions().len(), evictions_after_first);
    }

    #[tokio::test]
    async fn duplicate_events_are_classified_not_reapplied() {
        let repo = InMemoryRepository::new();
        let reconciler = reconciler(&repo, Arc::new(InMemoryCache::new()));

        let event = completed(100);
        let first = reconciler
            .ingest(SyncBatch::new(BatchId::random(), user(), vec![
                event.clone(),
            ]))
            .await
            .unwrap();
        assert_eq!(first.accepted, vec![event.event_id()]);

        // Same event under a fresh batch id: deduplicated by the store.
        let second = reconciler
            .ingest(SyncBatch::new(BatchId::random(), user(), vec![
                event.clone(),
            ]))
            .await
            .unwrap();
        assert!(second.accepted.is_empty());
        assert_eq!(second.duplicates, vec![event.event_id()]);

        let stream = repo.read_stream(user(), SectionId::new(100)).await.unwrap();
        assert_eq!(stream.len(), 1);
    }

    #[tokio::test]
    async fn clock_skewed_event_is_rejected() {
        let repo = InMemoryRepository::new();
        let reconciler = reconciler(&repo, Arc::new(InMemoryCache::new()));

        let skewed = ProgressEvent::new(
            EventId::random(),
            user(),
            SectionId::new(100),
            LessonId::new(10),
            CourseId::new(1),
            EventKind::Completed,
            fixed_now() + Duration::hours(2),
        )
        .unwrap();

        let result = reconciler
            .ingest(SyncBatch::new(BatchId::random(), user(), vec![skewed]))
            .await
            .unwrap();

        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].1, RejectReason::ClockSkew);
        let letters = repo.letters_for_user(user()).await.unwrap();
        assert_eq!(letters[0].reason, DeadLetterReason::ClockSkew);
    }

    #[tokio::test]
    async fn mismatched_parent_claim_is_an_unknown_reference() {
        let repo = InMemoryRepository::new();
        let reconciler = reconciler(&repo, Arc::new(InMemoryCache::new()));

        // Section 100 belongs to lesson 10, not lesson 11.
        let mismatched = ProgressEvent::new(
            EventId::random(),
            user(),
            SectionId::new(100),
            LessonId::new(11),
            CourseId::new(1),
            EventKind::Completed,
            fixed_now(),
        )
        .unwrap();

        let result = reconciler
            .ingest(SyncBatch::new(BatchId::random(), user(), vec![mismatched]))
            .await
            .unwrap();
        assert_eq!(result.rejected[0].1, RejectReason::UnknownReference);
    }

    #[tokio::test]
    async fn burst_on_one_section_invalidates_course_once() {
        let repo = InMemoryRepository::new();
        let cache = Arc::new(InMemoryCache::new());
        let reconciler = reconciler(&repo, Arc::clone(&cache));

        // Four events, three of them on the same stream.
        let events = vec![
            completed(100),
            completed(100),
            completed(100),
            completed(101),
        ];
        reconciler
            .ingest(SyncBatch::new(BatchId::random(), user(), events))
            .await
            .unwrap();

        let summary_evictions = cache
            .evictions()
            .iter()
            .filter(|k| k.starts_with("course-summary:"))
            .count();
        assert_eq!(summary_evictions, 1);
    }
}
