use chrono::Duration as ChronoDuration;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum EngineSettingsError {
    #[error("clock skew allowance must not be negative")]
    NegativeSkewAllowance,

    #[error("batch dedup window must hold at least one batch")]
    ZeroDedupWindow,

    #[error("offline queue capacity must be at least one")]
    ZeroQueueCapacity,

    #[error("time-delta ceiling factor must be at least one")]
    ZeroCeilingFactor,

    #[error("retry base delay must be non-zero")]
    ZeroRetryDelay,
}

/// Unvalidated engine settings, as read from the host's configuration.
#[derive(Debug, Clone)]
pub struct EngineSettingsDraft {
    /// How far into the future a client timestamp may point before the
    /// event is rejected with `ClockSkew`.
    pub clock_skew_allowance: ChronoDuration,
    /// Wall-clock budget for ingesting one sync batch.
    pub ingest_timeout: Duration,
    /// How many recent batch ids the dedup window retains.
    pub dedup_window: usize,
    /// Maximum entries the client-side offline queue may hold.
    pub queue_capacity: usize,
    /// A time-spent delta above `lesson estimated duration × factor` is
    /// excluded from the sum and flagged for audit.
    pub time_ceiling_factor: u32,
    /// Retry attempts for a transient store failure during append.
    pub append_max_retries: u32,
    /// Retry attempts for delivering a cache invalidation.
    pub invalidation_max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl Default for EngineSettingsDraft {
    fn default() -> Self {
        Self {
            clock_skew_allowance: ChronoDuration::minutes(5),
            ingest_timeout: Duration::from_secs(30),
            dedup_window: 256,
            queue_capacity: 1024,
            time_ceiling_factor: 3,
            append_max_retries: 5,
            invalidation_max_retries: 5,
            retry_base_delay: Duration::from_millis(50),
        }
    }
}

impl EngineSettingsDraft {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the draft into usable settings.
    ///
    /// # Errors
    ///
    /// Returns `EngineSettingsError` for zero windows/capacities/factors and
    /// negative allowances.
    pub fn validate(self) -> Result<EngineSettings, EngineSettingsError> {
        if self.clock_skew_allowance < ChronoDuration::zero() {
            return Err(EngineSettingsError::NegativeSkewAllowance);
        }
        if self.dedup_window == 0 {
            return Err(EngineSettingsError::ZeroDedupWindow);
        }
        if self.queue_capacity == 0 {
            return Err(EngineSettingsError::ZeroQueueCapacity);
        }
        if self.time_ceiling_factor == 0 {
            return Err(EngineSettingsError::ZeroCeilingFactor);
        }
        if self.retry_base_delay.is_zero() {
            return Err(EngineSettingsError::ZeroRetryDelay);
        }

        Ok(EngineSettings {
            clock_skew_allowance: self.clock_skew_allowance,
            ingest_timeout: self.ingest_timeout,
            dedup_window: self.dedup_window,
            queue_capacity: self.queue_capacity,
            time_ceiling_factor: self.time_ceiling_factor,
            append_max_retries: self.append_max_retries,
            invalidation_max_retries: self.invalidation_max_retries,
            retry_base_delay: self.retry_base_delay,
        })
    }
}

/// Validated knobs shared by the engine's services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    clock_skew_allowance: ChronoDuration,
    ingest_timeout: Duration,
    dedup_window: usize,
    queue_capacity: usize,
    time_ceiling_factor: u32,
    append_max_retries: u32,
    invalidation_max_retries: u32,
    retry_base_delay: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettingsDraft::default()
            .validate()
            .expect("default settings are valid")
    }
}

impl EngineSettings {
    #[must_use]
    pub fn clock_skew_allowance(&self) -> ChronoDuration {
        self.clock_skew_allowance
    }

    #[must_use]
    pub fn ingest_timeout(&self) -> Duration {
        self.ingest_timeout
    }

    #[must_use]
    pub fn dedup_window(&self) -> usize {
        self.dedup_window
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[must_use]
    pub fn time_ceiling_factor(&self) -> u32 {
        self.time_ceiling_factor
    }

    #[must_use]
    pub fn append_max_retries(&self) -> u32 {
        self.append_max_retries
    }

    #[must_use]
    pub fn invalidation_max_retries(&self) -> u32 {
        self.invalidation_max_retries
    }

    #[must_use]
    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }
}
