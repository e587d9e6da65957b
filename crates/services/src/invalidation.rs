use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use progress_core::model::{CourseId, CourseProgress, EngineSettings, LessonProgress, UserId};

use crate::backoff::Backoff;

/// Capacity of each per-(user, course) progress feed. A subscriber that lags
/// further than this misses intermediate states, never the latest one.
const FEED_CAPACITY: usize = 32;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

/// Cached rollup entries the engine evicts when aggregates change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    CourseSummary { user_id: UserId, course_id: CourseId },
    Dashboard { user_id: UserId },
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::CourseSummary { user_id, course_id } => {
                write!(f, "course-summary:{user_id}:{course_id}")
            }
            CacheKey::Dashboard { user_id } => write!(f, "dashboard:{user_id}"),
        }
    }
}

/// Eviction contract implemented by the host's cache layer.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Drop the entry for this key so the next read recomputes it.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Unavailable` when the cache layer cannot be
    /// reached; the manager retries on a backoff queue.
    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// In-memory cache for tests and embedded use; records evictions so tests
/// can assert on them.
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, String>>,
    evictions: Mutex<Vec<String>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: &CacheKey, value: String) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key.to_string())
            .cloned()
    }

    /// Keys evicted so far, in order.
    #[must_use]
    pub fn evictions(&self) -> Vec<String> {
        self.evictions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
        let rendered = key.to_string();
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&rendered);
        self.evictions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(rendered);
        Ok(())
    }
}

/// Keeps downstream caches coherent with fresh aggregates and fans updated
/// course progress out to subscribers.
///
/// Cached rollups are evicted, never patched in place: a cache miss is
/// cheaper than serving a stale partial rollup. Delivery is fire-and-forget
/// but at-least-once: failed evictions retry on a background backoff task
/// and never fail the synchronous write path.
pub struct CacheInvalidationManager {
    backend: Arc<dyn CacheBackend>,
    settings: EngineSettings,
    feeds: Mutex<HashMap<(UserId, CourseId), broadcast::Sender<CourseProgress>>>,
}

impl CacheInvalidationManager {
    #[must_use]
    pub fn new(backend: Arc<dyn CacheBackend>, settings: EngineSettings) -> Self {
        Self {
            backend,
            settings,
            feeds: Mutex::new(HashMap::new()),
        }
    }

    /// React to a refreshed course aggregate: notify subscribers and evict
    /// the course summary and dashboard entries.
    pub async fn on_course_updated(&self, progress: &CourseProgress) {
        self.publish(progress);
        self.invalidate(CacheKey::CourseSummary {
            user_id: progress.user_id(),
            course_id: progress.course_id(),
        })
        .await;
        self.invalidate(CacheKey::Dashboard {
            user_id: progress.user_id(),
        })
        .await;
    }

    /// React to a refreshed lesson aggregate: the user's dashboard shows
    /// lesson-level partials, so its entry is evicted.
    pub async fn on_lesson_updated(&self, progress: &LessonProgress) {
        self.invalidate(CacheKey::Dashboard {
            user_id: progress.user_id(),
        })
        .await;
    }

    /// Stream of course progress updates for dashboards and notifications.
    ///
    /// Each call returns a fresh receiver on the per-(user, course) feed.
    pub fn subscribe(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> broadcast::Receiver<CourseProgress> {
        let mut feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        feeds
            .entry((user_id, course_id))
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe()
    }

    fn publish(&self, progress: &CourseProgress) {
        let feeds = self.feeds.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = feeds.get(&(progress.user_id(), progress.course_id())) {
            // Only fails when no receiver is currently subscribed.
            if sender.send(progress.clone()).is_err() {
                debug!(
                    user = %progress.user_id(),
                    course = %progress.course_id(),
                    "progress update had no live subscribers"
                );
            }
        }
    }

    async fn invalidate(&self, key: CacheKey) {
        match self.backend.invalidate(&key).await {
            Ok(()) => debug!(%key, "cache entry evicted"),
            Err(e) => {
                warn!(%key, error = %e, "cache eviction failed, queued for retry");
                self.retry_in_background(key);
            }
        }
    }

    fn retry_in_background(&self, key: CacheKey) {
        let backend = Arc::clone(&self.backend);
        let mut backoff = Backoff::new(
            self.settings.retry_base_delay(),
            self.settings.invalidation_max_retries(),
        );
        tokio::spawn(async move {
            while let Some(delay) = backoff.next_delay() {
                tokio::time::sleep(delay).await;
                match backend.invalidate(&key).await {
                    Ok(()) => {
                        debug!(%key, attempts = backoff.attempts(), "cache eviction retried");
                        return;
                    }
                    Err(e) => warn!(%key, error = %e, "cache eviction retry failed"),
                }
            }
            error!(%key, "cache eviction retries exhausted, entry may be stale");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use progress_core::time::fixed_now;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn course_progress(user: u64, course: u64) -> CourseProgress {
        CourseProgress::from_counts(UserId::new(user), CourseId::new(course), 2, 2)
            .unwrap()
            .with_completion_time(None, fixed_now())
    }

    #[test]
    fn cache_keys_render_stably() {
        let summary = CacheKey::CourseSummary {
            user_id: UserId::new(7),
            course_id: CourseId::new(3),
        };
        let dashboard = CacheKey::Dashboard {
            user_id: UserId::new(7),
        };
        assert_eq!(summary.to_string(), "course-summary:7:3");
        assert_eq!(dashboard.to_string(), "dashboard:7");
    }

    #[tokio::test]
    async fn course_update_evicts_summary_and_dashboard() {
        let cache = Arc::new(InMemoryCache::new());
        let manager =
            CacheInvalidationManager::new(Arc::clone(&cache) as Arc<dyn CacheBackend>, EngineSettings::default());

        let progress = course_progress(7, 3);
        cache.put(
            &CacheKey::CourseSummary {
                user_id: progress.user_id(),
                course_id: progress.course_id(),
            },
            "stale".to_string(),
        );

        manager.on_course_updated(&progress).await;

        assert_eq!(
            cache.evictions(),
            vec!["course-summary:7:3".to_string(), "dashboard:7".to_string()]
        );
        assert!(cache
            .get(&CacheKey::CourseSummary {
                user_id: progress.user_id(),
                course_id: progress.course_id(),
            })
            .is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_course_updates() {
        let manager = CacheInvalidationManager::new(
            Arc::new(InMemoryCache::new()),
            EngineSettings::default(),
        );

        let mut receiver = manager.subscribe(UserId::new(7), CourseId::new(3));
        let progress = course_progress(7, 3);
        manager.on_course_updated(&progress).await;

        let received = receiver.recv().await.unwrap();
        assert_eq!(received, progress);
    }

    struct FlakyCache {
        failures_left: AtomicU32,
        inner: InMemoryCache,
    }

    #[async_trait]
    impl CacheBackend for FlakyCache {
        async fn invalidate(&self, key: &CacheKey) -> Result<(), CacheError> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CacheError::Unavailable("cache offline".into()));
            }
            self.inner.invalidate(key).await
        }
    }

    #[tokio::test]
    async fn failed_evictions_retry_in_the_background() {
        let cache = Arc::new(FlakyCache {
            failures_left: AtomicU32::new(2),
            inner: InMemoryCache::new(),
        });
        let manager =
            CacheInvalidationManager::new(Arc::clone(&cache) as Arc<dyn CacheBackend>, EngineSettings::default());

        let progress = course_progress(7, 3);
        // The write path returns immediately even though the cache is down.
        manager.on_course_updated(&progress).await;

        // Both evictions eventually land via the retry task.
        for _ in 0..50 {
            if cache.inner.evictions().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(cache.inner.evictions().len(), 2);
    }
}
