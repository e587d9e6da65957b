use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, warn};

use progress_core::Clock;
use progress_core::hierarchy::ContentHierarchy;
use progress_core::model::{
    CourseId, CourseProgress, EngineSettings, EventKind, LessonId, LessonProgress, SectionId,
    SectionProgress, UserId,
};
use storage::repository::{
    AggregateRepository, DeadLetter, DeadLetterReason, DeadLetterRepository, EventStore,
};

use crate::error::AggregatorError;

type StreamKey = (UserId, SectionId);

/// Hands out one async mutex per (user, section) stream so recomputation for
/// the same stream serializes while distinct streams proceed concurrently.
#[derive(Default)]
struct StreamLocks {
    locks: Mutex<HashMap<StreamKey, Arc<AsyncMutex<()>>>>,
}

impl StreamLocks {
    fn for_stream(&self, key: StreamKey) -> Arc<AsyncMutex<()>> {
        let mut guard = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guard.entry(key).or_default())
    }
}

/// Everything a single stream recompute refreshed: the section itself and,
/// when the section is attached to the hierarchy, its lesson and course
/// rollups.
#[derive(Debug, Clone)]
pub struct AggregateUpdate {
    pub section: SectionProgress,
    pub lesson: Option<LessonProgress>,
    pub course: Option<CourseProgress>,
}

/// Folds event streams into section state and rolls section state up into
/// lesson and course aggregates.
///
/// Recomputation is idempotent and order-independent for a fixed event set:
/// recomputing twice against an unchanged store yields identical aggregates.
pub struct ProgressAggregator {
    events: Arc<dyn EventStore>,
    aggregates: Arc<dyn AggregateRepository>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    hierarchy: Arc<dyn ContentHierarchy>,
    clock: Clock,
    settings: EngineSettings,
    stream_locks: StreamLocks,
}

impl ProgressAggregator {
    #[must_use]
    pub fn new(
        events: Arc<dyn EventStore>,
        aggregates: Arc<dyn AggregateRepository>,
        dead_letters: Arc<dyn DeadLetterRepository>,
        hierarchy: Arc<dyn ContentHierarchy>,
    ) -> Self {
        Self {
            events,
            aggregates,
            dead_letters,
            hierarchy,
            clock: Clock::default(),
            settings: EngineSettings::default(),
            stream_locks: StreamLocks::default(),
        }
    }

    /// Override the clock (usually for deterministic testing).
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Recompute a section's state from its full event stream, then roll the
    /// result up into the owning lesson and course.
    ///
    /// A section the hierarchy does not know is folded but not rolled up:
    /// orphans are logged and excluded, never fatal.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::Storage` for backend failures and
    /// `AggregatorError::Inconsistency` when a rollup invariant breaks with
    /// no previous known-good aggregate to fall back on.
    pub async fn recompute_stream(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<AggregateUpdate, AggregatorError> {
        let section = self.recompute_section(user_id, section_id).await?;

        let Some(parents) = self.hierarchy.section_parents(section_id) else {
            warn!(
                user = %user_id,
                section = %section_id,
                "section belongs to no known lesson, excluded from rollup"
            );
            return Ok(AggregateUpdate {
                section,
                lesson: None,
                course: None,
            });
        };

        let lesson = self.recompute_lesson(user_id, parents.lesson_id).await?;
        let course = self.recompute_course(user_id, parents.course_id).await?;

        Ok(AggregateUpdate {
            section,
            lesson: Some(lesson),
            course: Some(course),
        })
    }

    /// Fold a (user, section) stream into section progress.
    ///
    /// `Completed` OR-combines and never unsets; time-spent deltas sum unless
    /// they exceed the plausibility ceiling, in which case they are excluded
    /// from the sum and dead-lettered for audit; scores keep the best
    /// attempt.
    ///
    /// # Errors
    ///
    /// Returns `AggregatorError::Storage` if the stream or projection cannot
    /// be read or written.
    pub async fn recompute_section(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<SectionProgress, AggregatorError> {
        let lock = self.stream_locks.for_stream((user_id, section_id));
        let _guard = lock.lock_owned().await;

        let records = self.events.read_stream(user_id, section_id).await?;
        let previous = self.aggregates.get_section(user_id, section_id).await?;
        // Events at or below the watermark were audited by an earlier
        // recompute; only newly seen anomalies produce fresh letters.
        let audit_watermark = previous.as_ref().and_then(SectionProgress::last_event_seq);
        let ceiling = self.delta_ceiling(section_id);

        let mut progress = SectionProgress::new(user_id, section_id);
        for record in &records {
            match record.kind {
                EventKind::Completed => progress.record_completed(),
                EventKind::TimeSpentDelta(delta) => {
                    if ceiling.is_some_and(|max| delta > max) {
                        warn!(
                            user = %user_id,
                            section = %section_id,
                            event = %record.event_id,
                            delta_ms = delta.num_milliseconds(),
                            "time-spent delta exceeds plausibility ceiling, excluded from sum"
                        );
                        if audit_watermark.is_none_or(|w| record.sequence > w) {
                            self.dead_letters
                                .push_letter(&DeadLetter {
                                    event_id: record.event_id,
                                    user_id,
                                    reason: DeadLetterReason::AnomalousTimeDelta,
                                    detail: format!(
                                        "delta {}ms exceeds ceiling {}ms",
                                        delta.num_milliseconds(),
                                        ceiling.map_or(0, |c| c.num_milliseconds()),
                                    ),
                                    recorded_at: self.clock.now(),
                                })
                                .await?;
                        }
                    } else {
                        progress.add_time_spent(delta);
                    }
                }
                EventKind::ScoreRecorded(score) => progress.record_score(score),
            }
            progress.advance_to(record.sequence);
        }

        if let Some(previous) = previous {
            progress.absorb_previous(&previous);
        }
        self.aggregates.upsert_section(&progress).await?;
        Ok(progress)
    }

    /// Roll section completion up into the lesson.
    ///
    /// # Errors
    ///
    /// See [`ProgressAggregator::recompute_stream`].
    pub async fn recompute_lesson(
        &self,
        user_id: UserId,
        lesson_id: LessonId,
    ) -> Result<LessonProgress, AggregatorError> {
        let sections = self.hierarchy.lesson_sections(lesson_id);
        let total = u32::try_from(sections.len()).unwrap_or(u32::MAX);

        let mut completed = 0_u32;
        for section_id in &sections {
            let done = self
                .aggregates
                .get_section(user_id, *section_id)
                .await?
                .is_some_and(|p| p.completed());
            if done {
                completed = completed.saturating_add(1);
            }
        }

        let previous = self.aggregates.get_lesson(user_id, lesson_id).await?;
        match LessonProgress::from_counts(user_id, lesson_id, completed, total) {
            Ok(fresh) => {
                let next = match previous {
                    Some(prev) if prev.completed() && !fresh.completed() => {
                        warn!(
                            user = %user_id,
                            lesson = %lesson_id,
                            "lesson completion would regress, keeping previous aggregate"
                        );
                        prev
                    }
                    _ => fresh,
                };
                self.aggregates.upsert_lesson(&next).await?;
                Ok(next)
            }
            Err(inconsistency) => {
                error!(
                    user = %user_id,
                    lesson = %lesson_id,
                    %inconsistency,
                    "aggregation inconsistency, retaining previous lesson aggregate"
                );
                previous.ok_or(AggregatorError::Inconsistency(inconsistency))
            }
        }
    }

    /// Roll lesson completion up into the course, stamping `completed_at`
    /// exactly once on the transition to complete.
    ///
    /// A course with zero lessons is `completed=false, percentage=0`.
    ///
    /// # Errors
    ///
    /// See [`ProgressAggregator::recompute_stream`].
    pub async fn recompute_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<CourseProgress, AggregatorError> {
        let lessons = self.hierarchy.course_lessons(course_id);
        let total = u32::try_from(lessons.len()).unwrap_or(u32::MAX);

        let mut completed = 0_u32;
        for lesson_id in &lessons {
            let done = self
                .aggregates
                .get_lesson(user_id, *lesson_id)
                .await?
                .is_some_and(|p| p.completed());
            if done {
                completed = completed.saturating_add(1);
            }
        }

        let previous = self.aggregates.get_course(user_id, course_id).await?;
        match CourseProgress::from_counts(user_id, course_id, completed, total) {
            Ok(fresh) => {
                let next = match previous {
                    Some(prev) if prev.completed() && !fresh.completed() => {
                        warn!(
                            user = %user_id,
                            course = %course_id,
                            "course completion would regress, keeping previous aggregate"
                        );
                        prev
                    }
                    previous => fresh.with_completion_time(previous.as_ref(), self.clock.now()),
                };
                self.aggregates.upsert_course(&next).await?;
                Ok(next)
            }
            Err(inconsistency) => {
                error!(
                    user = %user_id,
                    course = %course_id,
                    %inconsistency,
                    "aggregation inconsistency, retaining previous course aggregate"
                );
                previous.ok_or(AggregatorError::Inconsistency(inconsistency))
            }
        }
    }

    /// Rebuild every projection under a course from the event log alone.
    ///
    /// Projections are disposable; this is the recompute half of the
    /// cache-or-recompute read path.
    ///
    /// # Errors
    ///
    /// See [`ProgressAggregator::recompute_stream`].
    pub async fn rebuild_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<CourseProgress, AggregatorError> {
        for lesson_id in self.hierarchy.course_lessons(course_id) {
            for section_id in self.hierarchy.lesson_sections(lesson_id) {
                self.recompute_section(user_id, section_id).await?;
            }
            self.recompute_lesson(user_id, lesson_id).await?;
        }
        self.recompute_course(user_id, course_id).await
    }

    fn delta_ceiling(&self, section_id: SectionId) -> Option<Duration> {
        let parents = self.hierarchy.section_parents(section_id)?;
        let estimated = self.hierarchy.lesson_estimated_duration(parents.lesson_id)?;
        let factor = i32::try_from(self.settings.time_ceiling_factor()).unwrap_or(i32::MAX);
        Some(estimated * factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progress_core::hierarchy::InMemoryHierarchy;
    use progress_core::model::{EventId, ProgressEvent};
    use progress_core::time::{fixed_clock, fixed_now};
    use storage::repository::InMemoryRepository;

    fn user() -> UserId {
        UserId::new(1)
    }

    fn course() -> CourseId {
        CourseId::new(1)
    }

    fn lesson() -> LessonId {
        LessonId::new(10)
    }

    fn section_a() -> SectionId {
        SectionId::new(100)
    }

    fn section_b() -> SectionId {
        SectionId::new(101)
    }

    fn hierarchy() -> Arc<InMemoryHierarchy> {
        Arc::new(
            InMemoryHierarchy::new()
                .with_lesson(course(), lesson(), &[section_a(), section_b()])
                .with_estimated_duration(lesson(), Duration::minutes(20)),
        )
    }

    fn aggregator(repo: &InMemoryRepository) -> ProgressAggregator {
        ProgressAggregator::new(
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            Arc::new(repo.clone()),
            hierarchy(),
        )
        .with_clock(fixed_clock())
    }

    fn event(section: SectionId, kind: EventKind) -> ProgressEvent {
        ProgressEvent::new(
            EventId::random(),
            user(),
            section,
            lesson(),
            course(),
            kind,
            fixed_now(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn recompute_is_idempotent() {
        let repo = InMemoryRepository::new();
        let aggregator = aggregator(&repo);

        repo.append(&event(section_a(), EventKind::Completed))
            .await
            .unwrap();
        repo.append(&event(
            section_a(),
            EventKind::TimeSpentDelta(Duration::minutes(5)),
        ))
        .await
        .unwrap();

        let first = aggregator.recompute_stream(user(), section_a()).await.unwrap();
        let second = aggregator.recompute_stream(user(), section_a()).await.unwrap();

        assert_eq!(first.section, second.section);
        assert_eq!(first.lesson, second.lesson);
        assert_eq!(first.course, second.course);
        assert!(first.section.completed());
        assert_eq!(first.section.time_spent_total(), Duration::minutes(5));
    }

    #[tokio::test]
    async fn completion_never_reverts() {
        let repo = InMemoryRepository::new();
        let aggregator = aggregator(&repo);

        repo.append(&event(section_a(), EventKind::Completed))
            .await
            .unwrap();
        let done = aggregator.recompute_section(user(), section_a()).await.unwrap();
        assert!(done.completed());

        // Later events cannot unset completion.
        repo.append(&event(
            section_a(),
            EventKind::TimeSpentDelta(Duration::minutes(1)),
        ))
        .await
        .unwrap();
        repo.append(&event(section_a(), EventKind::ScoreRecorded(0.2)))
            .await
            .unwrap();
        let still_done = aggregator.recompute_section(user(), section_a()).await.unwrap();
        assert!(still_done.completed());
    }

    #[tokio::test]
    async fn anomalous_delta_is_excluded_and_audited_once() {
        let repo = InMemoryRepository::new();
        let aggregator = aggregator(&repo);

        // Ceiling is 20min × 3 = 60min; 400min is implausible.
        repo.append(&event(
            section_a(),
            EventKind::TimeSpentDelta(Duration::minutes(400)),
        ))
        .await
        .unwrap();
        repo.append(&event(
            section_a(),
            EventKind::TimeSpentDelta(Duration::minutes(10)),
        ))
        .await
        .unwrap();

        let progress = aggregator.recompute_section(user(), section_a()).await.unwrap();
        assert_eq!(progress.time_spent_total(), Duration::minutes(10));

        let letters = repo.letters_for_user(user()).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::AnomalousTimeDelta);

        // Recomputing does not spam the audit set.
        aggregator.recompute_section(user(), section_a()).await.unwrap();
        assert_eq!(repo.letters_for_user(user()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn orphaned_section_is_excluded_from_rollup() {
        let repo = InMemoryRepository::new();
        let aggregator = aggregator(&repo);

        let orphan = SectionId::new(999);
        repo.append(&event(orphan, EventKind::Completed))
            .await
            .unwrap();

        let update = aggregator.recompute_stream(user(), orphan).await.unwrap();
        assert!(update.section.completed());
        assert!(update.lesson.is_none());
        assert!(update.course.is_none());
    }

    #[tokio::test]
    async fn lesson_completes_only_when_every_section_does() {
        let repo = InMemoryRepository::new();
        let aggregator = aggregator(&repo);

        repo.append(&event(section_a(), EventKind::Completed))
            .await
            .unwrap();
        let update = aggregator.recompute_stream(user(), section_a()).await.unwrap();
        let lesson = update.lesson.unwrap();
        assert_eq!(lesson.completed_section_count(), 1);
        assert!(!lesson.completed());

        repo.append(&event(section_b(), EventKind::Completed))
            .await
            .unwrap();
        let update = aggregator.recompute_stream(user(), section_b()).await.unwrap();
        let lesson = update.lesson.unwrap();
        assert!(lesson.completed());

        let course = update.course.unwrap();
        assert!(course.completed());
        assert_eq!(course.completed_at(), Some(fixed_now()));
    }

    #[tokio::test]
    async fn course_with_zero_lessons_is_defined() {
        let repo = InMemoryRepository::new();
        let aggregator = aggregator(&repo);

        let empty_course = CourseId::new(77);
        let progress = aggregator
            .recompute_course(user(), empty_course)
            .await
            .unwrap();
        assert!(!progress.completed());
        assert!((progress.completion_percentage() - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn rebuild_course_restores_dropped_projections() {
        let repo = InMemoryRepository::new();
        let aggregator = aggregator(&repo);

        for section in [section_a(), section_b()] {
            repo.append(&event(section, EventKind::Completed))
                .await
                .unwrap();
            aggregator.recompute_stream(user(), section).await.unwrap();
        }
        let before = repo.get_course(user(), course()).await.unwrap().unwrap();

        // Projections are disposable: a rebuild from the raw event log alone
        // reproduces them.
        let fresh_repo = InMemoryRepository::new();
        for section in [section_a(), section_b()] {
            for record in repo.read_stream(user(), section).await.unwrap() {
                fresh_repo
                    .append(&record.into_sequenced().unwrap().event)
                    .await
                    .unwrap();
            }
        }
        let rebuilt_aggregator = ProgressAggregator::new(
            Arc::new(fresh_repo.clone()),
            Arc::new(fresh_repo.clone()),
            Arc::new(fresh_repo.clone()),
            hierarchy(),
        )
        .with_clock(fixed_clock());

        let rebuilt = rebuilt_aggregator.rebuild_course(user(), course()).await.unwrap();
        assert_eq!(rebuilt, before);
    }
}
