use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::model::{CourseId, EventId, LessonId, SectionId, SequenceNumber, UserId};

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum EventError {
    #[error("time-spent delta must not be negative")]
    NegativeTimeDelta,

    #[error("recorded score must be finite, got {value}")]
    NonFiniteScore { value: f64 },
}

/// What a single progress event asserts about a section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventKind {
    /// The learner finished the section.
    Completed,
    /// The learner spent this much additional time in the section.
    TimeSpentDelta(Duration),
    /// The learner scored this value on the section's assessment.
    ScoreRecorded(f64),
}

/// Immutable fact recorded by the client action layer.
///
/// Events are only ever appended; once the store has acknowledged one, the
/// client's copy is discarded. `client_timestamp` is advisory (display and
/// plausibility checks only); the server-assigned sequence is the ordering
/// authority.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    event_id: EventId,
    user_id: UserId,
    section_id: SectionId,
    lesson_id: LessonId,
    course_id: CourseId,
    kind: EventKind,
    client_timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Build a validated event.
    ///
    /// # Errors
    ///
    /// Returns `EventError::NegativeTimeDelta` for a negative time-spent
    /// delta, and `EventError::NonFiniteScore` for a NaN/infinite score.
    pub fn new(
        event_id: EventId,
        user_id: UserId,
        section_id: SectionId,
        lesson_id: LessonId,
        course_id: CourseId,
        kind: EventKind,
        client_timestamp: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        match kind {
            EventKind::TimeSpentDelta(delta) if delta < Duration::zero() => {
                return Err(EventError::NegativeTimeDelta);
            }
            EventKind::ScoreRecorded(value) if !value.is_finite() => {
                return Err(EventError::NonFiniteScore { value });
            }
            _ => {}
        }

        Ok(Self {
            event_id,
            user_id,
            section_id,
            lesson_id,
            course_id,
            kind,
            client_timestamp,
        })
    }

    /// Rehydrate an event from persisted storage.
    ///
    /// # Errors
    ///
    /// Same validation as [`ProgressEvent::new`].
    pub fn from_persisted(
        event_id: EventId,
        user_id: UserId,
        section_id: SectionId,
        lesson_id: LessonId,
        course_id: CourseId,
        kind: EventKind,
        client_timestamp: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        Self::new(
            event_id,
            user_id,
            section_id,
            lesson_id,
            course_id,
            kind,
            client_timestamp,
        )
    }

    #[must_use]
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn section_id(&self) -> SectionId {
        self.section_id
    }

    #[must_use]
    pub fn lesson_id(&self) -> LessonId {
        self.lesson_id
    }

    #[must_use]
    pub fn course_id(&self) -> CourseId {
        self.course_id
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    #[must_use]
    pub fn client_timestamp(&self) -> DateTime<Utc> {
        self.client_timestamp
    }

    /// The (user, section) stream this event belongs to.
    #[must_use]
    pub fn stream(&self) -> (UserId, SectionId) {
        (self.user_id, self.section_id)
    }
}

/// An event together with the sequence the store assigned it.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedEvent {
    pub event: ProgressEvent,
    pub sequence: SequenceNumber,
}
