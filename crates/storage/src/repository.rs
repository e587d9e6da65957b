use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use progress_core::model::{
    BatchId, CourseId, CourseProgress, EventError, EventId, EventKind, LessonId, LessonProgress,
    ProgressEvent, SectionId, SectionProgress, SequenceNumber, SequencedEvent, SyncResult, UserId,
};

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    /// Transient backend failure. Safe to retry with backoff: appends are
    /// idempotent on event id.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Persisted shape of a sequenced event.
///
/// Mirrors the domain `ProgressEvent` plus the server-assigned sequence, so
/// repositories can serialize/deserialize without leaking storage concerns
/// into the domain layer.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_id: EventId,
    pub user_id: UserId,
    pub section_id: SectionId,
    pub lesson_id: LessonId,
    pub course_id: CourseId,
    pub kind: EventKind,
    pub client_timestamp: DateTime<Utc>,
    pub sequence: SequenceNumber,
    pub ingested_at: DateTime<Utc>,
}

impl EventRecord {
    #[must_use]
    pub fn from_event(
        event: &ProgressEvent,
        sequence: SequenceNumber,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event.event_id(),
            user_id: event.user_id(),
            section_id: event.section_id(),
            lesson_id: event.lesson_id(),
            course_id: event.course_id(),
            kind: event.kind(),
            client_timestamp: event.client_timestamp(),
            sequence,
            ingested_at,
        }
    }

    /// Convert the record back into a domain `SequencedEvent`.
    ///
    /// # Errors
    ///
    /// Returns `EventError` if the persisted kind fails validation.
    pub fn into_sequenced(self) -> Result<SequencedEvent, EventError> {
        let event = ProgressEvent::from_persisted(
            self.event_id,
            self.user_id,
            self.section_id,
            self.lesson_id,
            self.course_id,
            self.kind,
            self.client_timestamp,
        )?;
        Ok(SequencedEvent {
            event,
            sequence: self.sequence,
        })
    }
}

/// Result of an append: the sequence the event holds in its stream, and
/// whether this call inserted it or found it already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    pub sequence: SequenceNumber,
    pub newly_appended: bool,
}

/// Why an event landed in the dead-letter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    UnknownReference,
    ClockSkew,
    AnomalousTimeDelta,
}

impl DeadLetterReason {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::UnknownReference => "unknown_reference",
            DeadLetterReason::ClockSkew => "clock_skew",
            DeadLetterReason::AnomalousTimeDelta => "anomalous_time_delta",
        }
    }
}

/// An event held for manual review instead of normal processing.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub event_id: EventId,
    pub user_id: UserId,
    pub reason: DeadLetterReason,
    pub detail: String,
    pub recorded_at: DateTime<Utc>,
}

/// An event sitting in the client-side offline queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    /// Local monotonically increasing position, assigned at enqueue.
    pub local_seq: u64,
    /// The batch this entry was drained into, if any.
    pub batch_id: Option<BatchId>,
    /// Whether the server has acknowledged the entry's batch.
    pub acked: bool,
    pub event: ProgressEvent,
}

//
// ─── CONTRACTS ─────────────────────────────────────────────────────────────────
//

/// Append-only store of section-level progress events.
///
/// The single source of truth: every derived aggregate is reconstructable by
/// replaying a stream. Sequences are assigned per (user, section) stream and
/// are strictly increasing.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event, idempotently on its id.
    ///
    /// Re-appending an already-seen event id is a no-op returning the
    /// original sequence with `newly_appended=false`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Unavailable` on backend failure; the caller
    /// should retry with backoff.
    async fn append(&self, event: &ProgressEvent) -> Result<AppendOutcome, StorageError>;

    /// All events of a stream in sequence order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the stream cannot be read.
    async fn read_stream(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Events of a stream with sequence strictly greater than `since`, in
    /// sequence order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the stream cannot be read.
    async fn read_since(
        &self,
        user_id: UserId,
        section_id: SectionId,
        since: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StorageError>;
}

/// Disposable projections of the event log, keyed by
/// (user, section|lesson|course). Absence is normal and means "rebuild".
#[async_trait]
pub trait AggregateRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the projection cannot be stored.
    async fn upsert_section(&self, progress: &SectionProgress) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the projection cannot be read.
    async fn get_section(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<Option<SectionProgress>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the projection cannot be stored.
    async fn upsert_lesson(&self, progress: &LessonProgress) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the projection cannot be read.
    async fn get_lesson(
        &self,
        user_id: UserId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the projection cannot be stored.
    async fn upsert_course(&self, progress: &CourseProgress) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the projection cannot be read.
    async fn get_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StorageError>;
}

/// Bounded window of recently processed batches, used to replay results for
/// idempotent batch retries.
#[async_trait]
pub trait BatchLedger: Send + Sync {
    /// Record a processed batch, trimming entries beyond `window`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the ledger cannot be written.
    async fn record_batch(
        &self,
        batch_id: BatchId,
        user_id: UserId,
        result: &SyncResult,
        recorded_at: DateTime<Utc>,
        window: usize,
    ) -> Result<(), StorageError>;

    /// Cached result for a batch id still inside the window.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the ledger cannot be read.
    async fn lookup_batch(&self, batch_id: BatchId) -> Result<Option<SyncResult>, StorageError>;
}

/// Holding area for events that could not be processed automatically.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the letter cannot be stored.
    async fn push_letter(&self, letter: &DeadLetter) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the letters cannot be read.
    async fn letters_for_user(&self, user_id: UserId) -> Result<Vec<DeadLetter>, StorageError>;
}

/// Durable backing for the client-side offline queue: ordered iteration over
/// locally sequenced entries, plus acknowledgment bookkeeping.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Persist an event under the next local sequence; returns that sequence.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the entry cannot be stored.
    async fn push_event(&self, event: &ProgressEvent) -> Result<u64, StorageError>;

    /// All unacknowledged entries in local-sequence order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the queue cannot be read.
    async fn unacked(&self) -> Result<Vec<QueuedEvent>, StorageError>;

    /// Tag every unacknowledged, untagged entry with this batch id; returns
    /// how many were tagged.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the queue cannot be written.
    async fn assign_batch(&self, batch_id: BatchId) -> Result<usize, StorageError>;

    /// Mark every entry of the batch acknowledged; returns how many.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the queue cannot be written.
    async fn mark_acked(&self, batch_id: BatchId) -> Result<usize, StorageError>;

    /// Remove up to `max` of the oldest acknowledged entries; returns how
    /// many were removed. Unacknowledged entries are never touched.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the queue cannot be written.
    async fn purge_oldest_acked(&self, max: usize) -> Result<usize, StorageError>;

    /// Total entries currently held, acknowledged or not.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the queue cannot be read.
    async fn len(&self) -> Result<usize, StorageError>;
}

//
// ─── IN-MEMORY IMPLEMENTATION ──────────────────────────────────────────────────
//

#[derive(Default)]
struct InMemoryState {
    streams: HashMap<(UserId, SectionId), Vec<EventRecord>>,
    event_index: HashMap<EventId, (UserId, SectionId, SequenceNumber)>,
    sections: HashMap<(UserId, SectionId), SectionProgress>,
    lessons: HashMap<(UserId, LessonId), LessonProgress>,
    courses: HashMap<(UserId, CourseId), CourseProgress>,
    batches: Vec<(BatchId, UserId, SyncResult, DateTime<Utc>)>,
    dead_letters: Vec<DeadLetter>,
    queue: Vec<QueuedEvent>,
    next_local_seq: u64,
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    inner: Arc<Mutex<InMemoryState>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, InMemoryState>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl EventStore for InMemoryRepository {
    async fn append(&self, event: &ProgressEvent) -> Result<AppendOutcome, StorageError> {
        let mut state = self.lock()?;

        if let Some(&(_, _, sequence)) = state.event_index.get(&event.event_id()) {
            return Ok(AppendOutcome {
                sequence,
                newly_appended: false,
            });
        }

        let stream = event.stream();
        let records = state.streams.entry(stream).or_default();
        let sequence = records
            .last()
            .map_or(SequenceNumber::new(1), |r| r.sequence.next());
        records.push(EventRecord::from_event(event, sequence, Utc::now()));
        state
            .event_index
            .insert(event.event_id(), (stream.0, stream.1, sequence));

        Ok(AppendOutcome {
            sequence,
            newly_appended: true,
        })
    }

    async fn read_stream(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .streams
            .get(&(user_id, section_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn read_since(
        &self,
        user_id: UserId,
        section_id: SectionId,
        since: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .streams
            .get(&(user_id, section_id))
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.sequence > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl AggregateRepository for InMemoryRepository {
    async fn upsert_section(&self, progress: &SectionProgress) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state
            .sections
            .insert((progress.user_id(), progress.section_id()), progress.clone());
        Ok(())
    }

    async fn get_section(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<Option<SectionProgress>, StorageError> {
        let state = self.lock()?;
        Ok(state.sections.get(&(user_id, section_id)).cloned())
    }

    async fn upsert_lesson(&self, progress: &LessonProgress) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state
            .lessons
            .insert((progress.user_id(), progress.lesson_id()), progress.clone());
        Ok(())
    }

    async fn get_lesson(
        &self,
        user_id: UserId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StorageError> {
        let state = self.lock()?;
        Ok(state.lessons.get(&(user_id, lesson_id)).cloned())
    }

    async fn upsert_course(&self, progress: &CourseProgress) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state
            .courses
            .insert((progress.user_id(), progress.course_id()), progress.clone());
        Ok(())
    }

    async fn get_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StorageError> {
        let state = self.lock()?;
        Ok(state.courses.get(&(user_id, course_id)).cloned())
    }
}

#[async_trait]
impl BatchLedger for InMemoryRepository {
    async fn record_batch(
        &self,
        batch_id: BatchId,
        user_id: UserId,
        result: &SyncResult,
        recorded_at: DateTime<Utc>,
        window: usize,
    ) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.batches.retain(|(id, _, _, _)| *id != batch_id);
        state
            .batches
            .push((batch_id, user_id, result.clone(), recorded_at));
        while state.batches.len() > window {
            state.batches.remove(0);
        }
        Ok(())
    }

    async fn lookup_batch(&self, batch_id: BatchId) -> Result<Option<SyncResult>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .batches
            .iter()
            .find(|(id, _, _, _)| *id == batch_id)
            .map(|(_, _, result, _)| result.clone()))
    }
}

#[async_trait]
impl DeadLetterRepository for InMemoryRepository {
    async fn push_letter(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        let mut state = self.lock()?;
        state.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn letters_for_user(&self, user_id: UserId) -> Result<Vec<DeadLetter>, StorageError> {
        let state = self.lock()?;
        Ok(state
            .dead_letters
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QueueRepository for InMemoryRepository {
    async fn push_event(&self, event: &ProgressEvent) -> Result<u64, StorageError> {
        let mut state = self.lock()?;
        state.next_local_seq += 1;
        let local_seq = state.next_local_seq;
        state.queue.push(QueuedEvent {
            local_seq,
            batch_id: None,
            acked: false,
            event: event.clone(),
        });
        Ok(local_seq)
    }

    async fn unacked(&self) -> Result<Vec<QueuedEvent>, StorageError> {
        let state = self.lock()?;
        Ok(state.queue.iter().filter(|q| !q.acked).cloned().collect())
    }

    async fn assign_batch(&self, batch_id: BatchId) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let mut tagged = 0;
        for entry in state
            .queue
            .iter_mut()
            .filter(|q| !q.acked && q.batch_id.is_none())
        {
            entry.batch_id = Some(batch_id);
            tagged += 1;
        }
        Ok(tagged)
    }

    async fn mark_acked(&self, batch_id: BatchId) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let mut acked = 0;
        for entry in state
            .queue
            .iter_mut()
            .filter(|q| q.batch_id == Some(batch_id) && !q.acked)
        {
            entry.acked = true;
            acked += 1;
        }
        Ok(acked)
    }

    async fn purge_oldest_acked(&self, max: usize) -> Result<usize, StorageError> {
        let mut state = self.lock()?;
        let mut remaining = max;
        let before = state.queue.len();
        state.queue.retain(|entry| {
            if remaining > 0 && entry.acked {
                remaining -= 1;
                false
            } else {
                true
            }
        });
        Ok(before - state.queue.len())
    }

    async fn len(&self) -> Result<usize, StorageError> {
        let state = self.lock()?;
        Ok(state.queue.len())
    }
}

//
// ─── STORAGE AGGREGATE ─────────────────────────────────────────────────────────
//

/// Aggregates the engine's repositories behind trait objects for easy backend
/// swapping.
#[derive(Clone)]
pub struct Storage {
    pub events: Arc<dyn EventStore>,
    pub aggregates: Arc<dyn AggregateRepository>,
    pub batches: Arc<dyn BatchLedger>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    pub queue: Arc<dyn QueueRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        Self {
            events: Arc::new(repo.clone()),
            aggregates: Arc::new(repo.clone()),
            batches: Arc::new(repo.clone()),
            dead_letters: Arc::new(repo.clone()),
            queue: Arc::new(repo),
        }
    }
}
