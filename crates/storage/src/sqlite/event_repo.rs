use chrono::Utc;
use tracing::debug;

use progress_core::model::{ProgressEvent, SectionId, SequenceNumber, UserId};

use super::{
    SqliteRepository,
    mapping::{id_i64, kind_to_columns, map_event_row, sequence_from_i64, sequence_to_i64, unavailable},
};
use crate::repository::{AppendOutcome, EventRecord, EventStore, StorageError};

/// Retries for the per-stream sequence race: two connections may both compute
/// MAX+1 before either commits; the loser hits the stream's unique constraint
/// and recomputes.
const APPEND_RACE_RETRIES: u32 = 3;

#[async_trait::async_trait]
impl EventStore for SqliteRepository {
    async fn append(&self, event: &ProgressEvent) -> Result<AppendOutcome, StorageError> {
        let user_id = id_i64("user_id", event.user_id().value())?;
        let section_id = id_i64("section_id", event.section_id().value())?;
        let lesson_id = id_i64("lesson_id", event.lesson_id().value())?;
        let course_id = id_i64("course_id", event.course_id().value())?;
        let event_id = event.event_id().to_string();
        let (kind, time_spent_ms, score) = kind_to_columns(event.kind())?;

        for _ in 0..=APPEND_RACE_RETRIES {
            let mut tx = self.pool().begin().await.map_err(unavailable)?;

            // Idempotency: a known event id is a no-op returning the original
            // sequence.
            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT server_sequence FROM progress_events WHERE event_id = ?1",
            )
            .bind(&event_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;

            if let Some(seq) = existing {
                return Ok(AppendOutcome {
                    sequence: sequence_from_i64(seq)?,
                    newly_appended: false,
                });
            }

            let next_seq = sqlx::query_scalar::<_, i64>(
                r"
                    SELECT COALESCE(MAX(server_sequence), 0) + 1
                    FROM progress_events
                    WHERE user_id = ?1 AND section_id = ?2
                ",
            )
            .bind(user_id)
            .bind(section_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(unavailable)?;

            let inserted = sqlx::query(
                r"
                    INSERT INTO progress_events (
                        user_id, section_id, server_sequence, event_id,
                        lesson_id, course_id, kind, time_spent_ms, score,
                        client_timestamp, ingested_at
                    )
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                ",
            )
            .bind(user_id)
            .bind(section_id)
            .bind(next_seq)
            .bind(&event_id)
            .bind(lesson_id)
            .bind(course_id)
            .bind(kind)
            .bind(time_spent_ms)
            .bind(score)
            .bind(event.client_timestamp())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await;

            match inserted {
                Ok(_) => {
                    tx.commit().await.map_err(unavailable)?;
                    return Ok(AppendOutcome {
                        sequence: sequence_from_i64(next_seq)?,
                        newly_appended: true,
                    });
                }
                // Lost a race: either a concurrent append of the same event
                // id (found on the next pass) or a sequence collision on the
                // stream (recomputed on the next pass).
                Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => {
                    debug!(event_id = %event.event_id(), "append raced, retrying");
                    drop(tx);
                }
                Err(e) => return Err(unavailable(e)),
            }
        }

        Err(StorageError::Conflict)
    }

    async fn read_stream(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let section = id_i64("section_id", section_id.value())?;

        let rows = sqlx::query(
            r"
                SELECT
                    user_id, section_id, server_sequence, event_id,
                    lesson_id, course_id, kind, time_spent_ms, score,
                    client_timestamp, ingested_at
                FROM progress_events
                WHERE user_id = ?1 AND section_id = ?2
                ORDER BY server_sequence ASC
            ",
        )
        .bind(user)
        .bind(section)
        .fetch_all(self.pool())
        .await
        .map_err(unavailable)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_event_row(&row)?);
        }
        Ok(out)
    }

    async fn read_since(
        &self,
        user_id: UserId,
        section_id: SectionId,
        since: SequenceNumber,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let section = id_i64("section_id", section_id.value())?;
        let since = sequence_to_i64(since)?;

        let rows = sqlx::query(
            r"
                SELECT
                    user_id, section_id, server_sequence, event_id,
                    lesson_id, course_id, kind, time_spent_ms, score,
                    client_timestamp, ingested_at
                FROM progress_events
                WHERE user_id = ?1 AND section_id = ?2 AND server_sequence > ?3
                ORDER BY server_sequence ASC
            ",
        )
        .bind(user)
        .bind(section)
        .bind(since)
        .fetch_all(self.pool())
        .await
        .map_err(unavailable)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_event_row(&row)?);
        }
        Ok(out)
    }
}
