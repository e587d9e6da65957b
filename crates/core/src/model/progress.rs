use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::model::{CourseId, LessonId, SectionId, SequenceNumber, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProgressError {
    #[error("completed count ({completed}) exceeds total ({total})")]
    CountExceedsTotal { completed: u32, total: u32 },

    #[error("time spent must not be negative")]
    NegativeTimeSpent,
}

//
// ─── SECTION ───────────────────────────────────────────────────────────────────
//

/// Derived per-section state, folded from the section's event stream.
///
/// A projection of the event log, not a source of truth: it can be dropped
/// and rebuilt at any time. `completed` only ever transitions false→true and
/// `time_spent_total` never decreases.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionProgress {
    user_id: UserId,
    section_id: SectionId,
    completed: bool,
    time_spent_total: Duration,
    best_score: Option<f64>,
    last_event_seq: Option<SequenceNumber>,
}

impl SectionProgress {
    /// State of a section with no events yet.
    #[must_use]
    pub fn new(user_id: UserId, section_id: SectionId) -> Self {
        Self {
            user_id,
            section_id,
            completed: false,
            time_spent_total: Duration::zero(),
            best_score: None,
            last_event_seq: None,
        }
    }

    /// Rehydrate section progress from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::NegativeTimeSpent` if the stored total is
    /// negative.
    pub fn from_persisted(
        user_id: UserId,
        section_id: SectionId,
        completed: bool,
        time_spent_total: Duration,
        best_score: Option<f64>,
        last_event_seq: Option<SequenceNumber>,
    ) -> Result<Self, ProgressError> {
        if time_spent_total < Duration::zero() {
            return Err(ProgressError::NegativeTimeSpent);
        }
        Ok(Self {
            user_id,
            section_id,
            completed,
            time_spent_total,
            best_score,
            last_event_seq,
        })
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
    pub fn completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn time_spent_total(&self) -> Duration {
        self.time_spent_total
    }

    #[must_use]
    pub fn best_score(&self) -> Option<f64> {
        self.best_score
    }

    #[must_use]
    pub fn last_event_seq(&self) -> Option<SequenceNumber> {
        self.last_event_seq
    }

    /// Marks the section complete. Completion never reverts.
    pub fn record_completed(&mut self) {
        self.completed = true;
    }

    /// Adds an accepted time-spent delta to the running total.
    ///
    /// Negative deltas are rejected at event construction, so the total is
    /// monotonically non-decreasing.
    pub fn add_time_spent(&mut self, delta: Duration) {
        if delta > Duration::zero() {
            self.time_spent_total += delta;
        }
    }

    /// Folds in a recorded score, keeping the best attempt.
    pub fn record_score(&mut self, score: f64) {
        self.best_score = Some(match self.best_score {
            Some(best) if best >= score => best,
            _ => score,
        });
    }

    /// Advances the high-water mark of folded sequences.
    pub fn advance_to(&mut self, seq: SequenceNumber) {
        if self.last_event_seq.is_none_or(|last| seq > last) {
            self.last_event_seq = Some(seq);
        }
    }

    /// Merges a previously stored projection so monotonic fields never
    /// regress, even if the recompute saw a partially trimmed stream.
    pub fn absorb_previous(&mut self, previous: &SectionProgress) {
        self.completed |= previous.completed;
        if previous.time_spent_total > self.time_spent_total {
            self.time_spent_total = previous.time_spent_total;
        }
        if let Some(score) = previous.best_score {
            self.record_score(score);
        }
        if let Some(seq) = previous.last_event_seq {
            self.advance_to(seq);
        }
    }
}

//
// ─── LESSON ────────────────────────────────────────────────────────────────────
//

/// Derived per-lesson rollup of section completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LessonProgress {
    user_id: UserId,
    lesson_id: LessonId,
    completed_section_count: u32,
    total_section_count: u32,
    completed: bool,
}

impl LessonProgress {
    /// Build a lesson rollup from section counts.
    ///
    /// A lesson with zero sections is never complete.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::CountExceedsTotal` if the completed count
    /// exceeds the total, the aggregation-inconsistency signal.
    pub fn from_counts(
        user_id: UserId,
        lesson_id: LessonId,
        completed_section_count: u32,
        total_section_count: u32,
    ) -> Result<Self, ProgressError> {
        if completed_section_count > total_section_count {
            return Err(ProgressError::CountExceedsTotal {
                completed: completed_section_count,
                total: total_section_count,
            });
        }
        Ok(Self {
            user_id,
            lesson_id,
            completed_section_count,
            total_section_count,
            completed: total_section_count > 0
                && completed_section_count == total_section_count,
        })
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn lesson_id(&self) -> LessonId {
        self.lesson_id
    }

    #[must_use]
    pub fn completed_section_count(&self) -> u32 {
        self.completed_section_count
    }

    #[must_use]
    pub fn total_section_count(&self) -> u32 {
        self.total_section_count
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed
    }

    /// Partial-completion percentage for display.
    #[must_use]
    pub fn percentage(&self) -> f64 {
        percentage_of(self.completed_section_count, self.total_section_count)
    }
}

//
// ─── COURSE ────────────────────────────────────────────────────────────────────
//

/// Derived per-course rollup of lesson completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CourseProgress {
    user_id: UserId,
    course_id: CourseId,
    completed_lesson_count: u32,
    total_lesson_count: u32,
    completion_percentage: f64,
    completed: bool,
    completed_at: Option<DateTime<Utc>>,
}

impl CourseProgress {
    /// Build a course rollup from lesson counts.
    ///
    /// A course with zero lessons is `completed=false, percentage=0` rather
    /// than a division by zero. `completed_at` starts unset; see
    /// [`CourseProgress::with_completion_time`].
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::CountExceedsTotal` if the completed count
    /// exceeds the total.
    pub fn from_counts(
        user_id: UserId,
        course_id: CourseId,
        completed_lesson_count: u32,
        total_lesson_count: u32,
    ) -> Result<Self, ProgressError> {
        if completed_lesson_count > total_lesson_count {
            return Err(ProgressError::CountExceedsTotal {
                completed: completed_lesson_count,
                total: total_lesson_count,
            });
        }
        Ok(Self {
            user_id,
            course_id,
            completed_lesson_count,
            total_lesson_count,
            completion_percentage: percentage_of(completed_lesson_count, total_lesson_count),
            completed: total_lesson_count > 0
                && completed_lesson_count == total_lesson_count,
            completed_at: None,
        })
    }

    /// Rehydrate course progress from persisted storage.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::CountExceedsTotal` if the stored counts do not
    /// align.
    pub fn from_persisted(
        user_id: UserId,
        course_id: CourseId,
        completed_lesson_count: u32,
        total_lesson_count: u32,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<Self, ProgressError> {
        let mut progress = Self::from_counts(
            user_id,
            course_id,
            completed_lesson_count,
            total_lesson_count,
        )?;
        if progress.completed {
            progress.completed_at = completed_at;
        }
        Ok(progress)
    }

    /// Resolves `completed_at`: carried over from the previous projection
    /// when already set, stamped with `now` exactly once on the false→true
    /// transition, never cleared.
    #[must_use]
    pub fn with_completion_time(
        mut self,
        previous: Option<&CourseProgress>,
        now: DateTime<Utc>,
    ) -> Self {
        if self.completed {
            self.completed_at = previous
                .and_then(CourseProgress::completed_at)
                .or(Some(now));
        }
        self
    }

    #[must_use]
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    #[must_use]
    pub fn course_id(&self) -> CourseId {
        self.course_id
    }

    #[must_use]
    pub fn completed_lesson_count(&self) -> u32 {
        self.completed_lesson_count
    }

    #[must_use]
    pub fn total_lesson_count(&self) -> u32 {
        self.total_lesson_count
    }

    #[must_use]
    pub fn completion_percentage(&self) -> f64 {
        self.completion_percentage
    }

    #[must_use]
    pub fn completed(&self) -> bool {
        self.completed
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }
}

fn percentage_of(completed: u32, total: u32) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (f64::from(completed) / f64::from(total) * 100.0).clamp(0.0, 100.0)
}
