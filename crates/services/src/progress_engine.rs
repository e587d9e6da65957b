use std::sync::Arc;

use tokio::sync::broadcast;

use progress_core::Clock;
use progress_core::hierarchy::ContentHierarchy;
use progress_core::model::{
    CourseId, CourseProgress, EngineSettings, LessonId, LessonProgress, SectionId, SectionProgress,
    SyncBatch, SyncResult, UserId,
};
use storage::repository::{DeadLetter, Storage};

use crate::aggregator::ProgressAggregator;
use crate::error::EngineError;
use crate::invalidation::{CacheBackend, CacheInvalidationManager, InMemoryCache};
use crate::reconciler::SyncReconciler;

/// Assembles the progress engine: event store, aggregator, reconciler, and
/// cache invalidation behind one facade.
///
/// `submit_events` is the ingest entry point; the `get_*` readers serve from
/// the stored projection when present and recompute from the event log when
/// not (projections are disposable).
pub struct ProgressEngine {
    storage: Storage,
    hierarchy: Arc<dyn ContentHierarchy>,
    cache: Arc<dyn CacheBackend>,
    settings: EngineSettings,
    clock: Clock,
    aggregator: Arc<ProgressAggregator>,
    reconciler: SyncReconciler,
    invalidation: Arc<CacheInvalidationManager>,
}

impl ProgressEngine {
    /// Build an engine over the given storage and content hierarchy with
    /// default settings, a real-time clock, and an in-memory cache backend.
    #[must_use]
    pub fn new(storage: Storage, hierarchy: Arc<dyn ContentHierarchy>) -> Self {
        Self::assemble(
            storage,
            hierarchy,
            Arc::new(InMemoryCache::new()),
            EngineSettings::default(),
            Clock::default(),
        )
    }

    /// Build an engine over in-memory storage, for tests and prototyping.
    #[must_use]
    pub fn in_memory(hierarchy: Arc<dyn ContentHierarchy>) -> Self {
        Self::new(Storage::in_memory(), hierarchy)
    }

    /// Build an engine backed by `SQLite` storage.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Sqlite` if connection or migrations fail.
    pub async fn sqlite(
        database_url: &str,
        hierarchy: Arc<dyn ContentHierarchy>,
    ) -> Result<Self, EngineError> {
        let storage = Storage::sqlite(database_url).await?;
        Ok(Self::new(storage, hierarchy))
    }

    /// Override the engine settings.
    #[must_use]
    pub fn with_settings(self, settings: EngineSettings) -> Self {
        Self::assemble(self.storage, self.hierarchy, self.cache, settings, self.clock)
    }

    /// Override the clock (usually for deterministic testing).
    #[must_use]
    pub fn with_clock(self, clock: Clock) -> Self {
        Self::assemble(self.storage, self.hierarchy, self.cache, self.settings, clock)
    }

    /// Override the cache backend the invalidation manager evicts from.
    #[must_use]
    pub fn with_cache_backend(self, cache: Arc<dyn CacheBackend>) -> Self {
        Self::assemble(self.storage, self.hierarchy, cache, self.settings, self.clock)
    }

    fn assemble(
        storage: Storage,
        hierarchy: Arc<dyn ContentHierarchy>,
        cache: Arc<dyn CacheBackend>,
        settings: EngineSettings,
        clock: Clock,
    ) -> Self {
        let aggregator = Arc::new(
            ProgressAggregator::new(
                Arc::clone(&storage.events),
                Arc::clone(&storage.aggregates),
                Arc::clone(&storage.dead_letters),
                Arc::clone(&hierarchy),
            )
            .with_clock(clock)
            .with_settings(settings.clone()),
        );
        let invalidation = Arc::new(CacheInvalidationManager::new(
            Arc::clone(&cache),
            settings.clone(),
        ));
        let reconciler = SyncReconciler::new(
            Arc::clone(&storage.events),
            Arc::clone(&storage.batches),
            Arc::clone(&storage.dead_letters),
            Arc::clone(&hierarchy),
            Arc::clone(&aggregator),
            Arc::clone(&invalidation),
            clock,
            settings.clone(),
        );

        Self {
            storage,
            hierarchy,
            cache,
            settings,
            clock,
            aggregator,
            reconciler,
            invalidation,
        }
    }

    /// Ingest a batch of client events. See [`SyncReconciler::ingest`].
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Sync` for timeouts and persistent store
    /// failures; partial success is reported inside the `SyncResult`, not as
    /// an error.
    pub async fn submit_events(&self, batch: SyncBatch) -> Result<SyncResult, EngineError> {
        Ok(self.reconciler.ingest(batch).await?)
    }

    /// Course progress, from the stored projection or recomputed from the
    /// event log when the projection is missing.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if storage fails or recomputation hits an
    /// unrecoverable inconsistency.
    pub async fn get_course_progress(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<CourseProgress, EngineError> {
        if let Some(progress) = self.storage.aggregates.get_course(user_id, course_id).await? {
            return Ok(progress);
        }
        Ok(self.aggregator.rebuild_course(user_id, course_id).await?)
    }

    /// Lesson progress, cache-or-recompute like the course reader.
    ///
    /// # Errors
    ///
    /// See [`ProgressEngine::get_course_progress`].
    pub async fn get_lesson_progress(
        &self,
        user_id: UserId,
        lesson_id: LessonId,
    ) -> Result<LessonProgress, EngineError> {
        if let Some(progress) = self.storage.aggregates.get_lesson(user_id, lesson_id).await? {
            return Ok(progress);
        }
        for section_id in self.hierarchy.lesson_sections(lesson_id) {
            self.aggregator.recompute_section(user_id, section_id).await?;
        }
        Ok(self.aggregator.recompute_lesson(user_id, lesson_id).await?)
    }

    /// Section progress, cache-or-recompute like the course reader.
    ///
    /// # Errors
    ///
    /// See [`ProgressEngine::get_course_progress`].
    pub async fn get_section_progress(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<SectionProgress, EngineError> {
        if let Some(progress) = self
            .storage
            .aggregates
            .get_section(user_id, section_id)
            .await?
        {
            return Ok(progress);
        }
        Ok(self.aggregator.recompute_section(user_id, section_id).await?)
    }

    /// Stream of course progress updates for dashboards and notifications.
    #[must_use]
    pub fn subscribe_progress_changed(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> broadcast::Receiver<CourseProgress> {
        self.invalidation.subscribe(user_id, course_id)
    }

    /// Events held for manual review: rejected references, clock skew, and
    /// audit-flagged time deltas.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Storage` if the dead-letter set cannot be read.
    pub async fn dead_letters(&self, user_id: UserId) -> Result<Vec<DeadLetter>, EngineError> {
        Ok(self.storage.dead_letters.letters_for_user(user_id).await?)
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Current time according to the engine's clock.
    #[must_use]
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}
