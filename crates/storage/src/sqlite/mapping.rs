use chrono::Duration;
use sqlx::Row;

use progress_core::model::{
    BatchId, CourseId, CourseProgress, EventId, EventKind, LessonId, LessonProgress,
    ProgressEvent, SectionId, SectionProgress, SequenceNumber, UserId,
};

use crate::repository::{
    DeadLetter, DeadLetterReason, EventRecord, QueuedEvent, StorageError,
};

pub(crate) fn ser<E: core::fmt::Display>(e: E) -> StorageError {
    StorageError::Serialization(e.to_string())
}

pub(crate) fn unavailable(e: sqlx::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

pub(crate) fn id_i64(field: &'static str, v: u64) -> Result<i64, StorageError> {
    i64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} overflow")))
}

fn i64_to_u64(field: &'static str, v: i64) -> Result<u64, StorageError> {
    u64::try_from(v).map_err(|_| StorageError::Serialization(format!("{field} sign overflow")))
}

pub(crate) fn user_id_from_i64(v: i64) -> Result<UserId, StorageError> {
    Ok(UserId::new(i64_to_u64("user_id", v)?))
}

pub(crate) fn section_id_from_i64(v: i64) -> Result<SectionId, StorageError> {
    Ok(SectionId::new(i64_to_u64("section_id", v)?))
}

pub(crate) fn lesson_id_from_i64(v: i64) -> Result<LessonId, StorageError> {
    Ok(LessonId::new(i64_to_u64("lesson_id", v)?))
}

pub(crate) fn course_id_from_i64(v: i64) -> Result<CourseId, StorageError> {
    Ok(CourseId::new(i64_to_u64("course_id", v)?))
}

pub(crate) fn sequence_from_i64(v: i64) -> Result<SequenceNumber, StorageError> {
    Ok(SequenceNumber::new(i64_to_u64("server_sequence", v)?))
}

pub(crate) fn sequence_to_i64(seq: SequenceNumber) -> Result<i64, StorageError> {
    id_i64("server_sequence", seq.value())
}

pub(crate) fn event_id_from_str(s: &str) -> Result<EventId, StorageError> {
    s.parse::<EventId>().map_err(ser)
}

pub(crate) fn batch_id_from_str(s: &str) -> Result<BatchId, StorageError> {
    s.parse::<BatchId>().map_err(ser)
}

/// Storage encoding of an event kind: a tag column plus one value column.
/// `completed` carries no value, `time_spent` uses `time_spent_ms`,
/// `score` uses `score`.
pub(crate) fn kind_to_columns(
    kind: EventKind,
) -> Result<(&'static str, Option<i64>, Option<f64>), StorageError> {
    match kind {
        EventKind::Completed => Ok(("completed", None, None)),
        EventKind::TimeSpentDelta(delta) => {
            Ok(("time_spent", Some(delta.num_milliseconds()), None))
        }
        EventKind::ScoreRecorded(score) => Ok(("score", None, Some(score))),
    }
}

pub(crate) fn kind_from_columns(
    kind: &str,
    time_spent_ms: Option<i64>,
    score: Option<f64>,
) -> Result<EventKind, StorageError> {
    match kind {
        "completed" => Ok(EventKind::Completed),
        "time_spent" => {
            let ms = time_spent_ms
                .ok_or_else(|| StorageError::Serialization("missing time_spent_ms".into()))?;
            Ok(EventKind::TimeSpentDelta(Duration::milliseconds(ms)))
        }
        "score" => {
            let value =
                score.ok_or_else(|| StorageError::Serialization("missing score".into()))?;
            Ok(EventKind::ScoreRecorded(value))
        }
        other => Err(StorageError::Serialization(format!(
            "invalid event kind: {other}"
        ))),
    }
}

pub(crate) fn reason_to_str(reason: DeadLetterReason) -> &'static str {
    reason.as_str()
}

pub(crate) fn parse_reason(s: &str) -> Result<DeadLetterReason, StorageError> {
    match s {
        "unknown_reference" => Ok(DeadLetterReason::UnknownReference),
        "clock_skew" => Ok(DeadLetterReason::ClockSkew),
        "anomalous_time_delta" => Ok(DeadLetterReason::AnomalousTimeDelta),
        other => Err(StorageError::Serialization(format!(
            "invalid dead-letter reason: {other}"
        ))),
    }
}

pub(crate) fn map_event_row(row: &sqlx::sqlite::SqliteRow) -> Result<EventRecord, StorageError> {
    let kind = kind_from_columns(
        row.try_get::<String, _>("kind").map_err(ser)?.as_str(),
        row.try_get::<Option<i64>, _>("time_spent_ms").map_err(ser)?,
        row.try_get::<Option<f64>, _>("score").map_err(ser)?,
    )?;

    Ok(EventRecord {
        event_id: event_id_from_str(row.try_get::<String, _>("event_id").map_err(ser)?.as_str())?,
        user_id: user_id_from_i64(row.try_get::<i64, _>("user_id").map_err(ser)?)?,
        section_id: section_id_from_i64(row.try_get::<i64, _>("section_id").map_err(ser)?)?,
        lesson_id: lesson_id_from_i64(row.try_get::<i64, _>("lesson_id").map_err(ser)?)?,
        course_id: course_id_from_i64(row.try_get::<i64, _>("course_id").map_err(ser)?)?,
        kind,
        client_timestamp: row.try_get("client_timestamp").map_err(ser)?,
        sequence: sequence_from_i64(row.try_get::<i64, _>("server_sequence").map_err(ser)?)?,
        ingested_at: row.try_get("ingested_at").map_err(ser)?,
    })
}

pub(crate) fn map_section_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<SectionProgress, StorageError> {
    let time_spent_ms: i64 = row.try_get("time_spent_ms").map_err(ser)?;
    let last_event_seq = row
        .try_get::<Option<i64>, _>("last_event_seq")
        .map_err(ser)?
        .map(sequence_from_i64)
        .transpose()?;

    SectionProgress::from_persisted(
        user_id_from_i64(row.try_get::<i64, _>("user_id").map_err(ser)?)?,
        section_id_from_i64(row.try_get::<i64, _>("section_id").map_err(ser)?)?,
        row.try_get::<bool, _>("completed").map_err(ser)?,
        Duration::milliseconds(time_spent_ms),
        row.try_get::<Option<f64>, _>("best_score").map_err(ser)?,
        last_event_seq,
    )
    .map_err(ser)
}

pub(crate) fn map_lesson_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<LessonProgress, StorageError> {
    let completed: i64 = row.try_get("completed_section_count").map_err(ser)?;
    let total: i64 = row.try_get("total_section_count").map_err(ser)?;

    LessonProgress::from_counts(
        user_id_from_i64(row.try_get::<i64, _>("user_id").map_err(ser)?)?,
        lesson_id_from_i64(row.try_get::<i64, _>("lesson_id").map_err(ser)?)?,
        u32::try_from(completed)
            .map_err(|_| StorageError::Serialization("invalid completed_section_count".into()))?,
        u32::try_from(total)
            .map_err(|_| StorageError::Serialization("invalid total_section_count".into()))?,
    )
    .map_err(ser)
}

pub(crate) fn map_course_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<CourseProgress, StorageError> {
    let completed: i64 = row.try_get("completed_lesson_count").map_err(ser)?;
    let total: i64 = row.try_get("total_lesson_count").map_err(ser)?;

    CourseProgress::from_persisted(
        user_id_from_i64(row.try_get::<i64, _>("user_id").map_err(ser)?)?,
        course_id_from_i64(row.try_get::<i64, _>("course_id").map_err(ser)?)?,
        u32::try_from(completed)
            .map_err(|_| StorageError::Serialization("invalid completed_lesson_count".into()))?,
        u32::try_from(total)
            .map_err(|_| StorageError::Serialization("invalid total_lesson_count".into()))?,
        row.try_get("completed_at").map_err(ser)?,
    )
    .map_err(ser)
}

pub(crate) fn map_dead_letter_row(
    row: &sqlx::sqlite::SqliteRow,
) -> Result<DeadLetter, StorageError> {
    Ok(DeadLetter {
        event_id: event_id_from_str(row.try_get::<String, _>("event_id").map_err(ser)?.as_str())?,
        user_id: user_id_from_i64(row.try_get::<i64, _>("user_id").map_err(ser)?)?,
        reason: parse_reason(row.try_get::<String, _>("reason").map_err(ser)?.as_str())?,
        detail: row.try_get("detail").map_err(ser)?,
        recorded_at: row.try_get("recorded_at").map_err(ser)?,
    })
}

pub(crate) fn map_queue_row(row: &sqlx::sqlite::SqliteRow) -> Result<QueuedEvent, StorageError> {
    let kind = kind_from_columns(
        row.try_get::<String, _>("kind").map_err(ser)?.as_str(),
        row.try_get::<Option<i64>, _>("time_spent_ms").map_err(ser)?,
        row.try_get::<Option<f64>, _>("score").map_err(ser)?,
    )?;

    let event = ProgressEvent::from_persisted(
        event_id_from_str(row.try_get::<String, _>("event_id").map_err(ser)?.as_str())?,
        user_id_from_i64(row.try_get::<i64, _>("user_id").map_err(ser)?)?,
        section_id_from_i64(row.try_get::<i64, _>("section_id").map_err(ser)?)?,
        lesson_id_from_i64(row.try_get::<i64, _>("lesson_id").map_err(ser)?)?,
        course_id_from_i64(row.try_get::<i64, _>("course_id").map_err(ser)?)?,
        kind,
        row.try_get("client_timestamp").map_err(ser)?,
    )
    .map_err(ser)?;

    let batch_id = row
        .try_get::<Option<String>, _>("batch_id")
        .map_err(ser)?
        .map(|s| batch_id_from_str(s.as_str()))
        .transpose()?;

    Ok(QueuedEvent {
        local_seq: i64_to_u64("local_seq", row.try_get::<i64, _>("local_seq").map_err(ser)?)?,
        batch_id,
        acked: row.try_get::<bool, _>("acked").map_err(ser)?,
        event,
    })
}
