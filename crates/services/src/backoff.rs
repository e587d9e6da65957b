use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter for retrying transient failures.
///
/// Delays double per attempt from `base`, capped at `cap`, with up to 50%
/// random jitter added so concurrent retriers spread out. Yields `None` once
/// `max_attempts` delays have been handed out.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap: Duration::from_secs(5),
            max_attempts,
            attempt: 0,
        }
    }

    #[must_use]
    pub fn with_cap(mut self, cap: Duration) -> Self {
        self.cap = cap;
        self
    }

    /// Number of delays already handed out.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// The next delay to sleep before retrying, or `None` when retries are
    /// exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1_u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt += 1;

        // Capped delays stay far below u64 milliseconds.
        let jitter_range = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX) / 2;
        let jitter = if jitter_range == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_range)
        };
        Some(capped + Duration::from_millis(jitter))
    }
}
