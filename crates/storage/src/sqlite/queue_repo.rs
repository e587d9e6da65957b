use progress_core::model::{BatchId, ProgressEvent};

use super::{
    SqliteRepository,
    mapping::{id_i64, kind_to_columns, map_queue_row, unavailable},
};
use crate::repository::{QueueRepository, QueuedEvent, StorageError};

#[async_trait::async_trait]
impl QueueRepository for SqliteRepository {
    async fn push_event(&self, event: &ProgressEvent) -> Result<u64, StorageError> {
        let user_id = id_i64("user_id", event.user_id().value())?;
        let section_id = id_i64("section_id", event.section_id().value())?;
        let lesson_id = id_i64("lesson_id", event.lesson_id().value())?;
        let course_id = id_i64("course_id", event.course_id().value())?;
        let (kind, time_spent_ms, score) = kind_to_columns(event.kind())?;

        let res = sqlx::query(
            r"
                INSERT INTO offline_queue (
                    event_id, user_id, section_id, lesson_id, course_id,
                    kind, time_spent_ms, score, client_timestamp
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
        )
        .bind(event.event_id().to_string())
        .bind(user_id)
        .bind(section_id)
        .bind(lesson_id)
        .bind(course_id)
        .bind(kind)
        .bind(time_spent_ms)
        .bind(score)
        .bind(event.client_timestamp())
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        u64::try_from(res.last_insert_rowid())
            .map_err(|_| StorageError::Serialization("local_seq sign overflow".into()))
    }

    async fn unacked(&self) -> Result<Vec<QueuedEvent>, StorageError> {
        let rows = sqlx::query(
            r"
                SELECT local_seq, batch_id, acked, event_id, user_id, section_id,
                       lesson_id, course_id, kind, time_spent_ms, score, client_timestamp
                FROM offline_queue
                WHERE acked = 0
                ORDER BY local_seq ASC
            ",
        )
        .fetch_all(self.pool())
        .await
        .map_err(unavailable)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_queue_row(&row)?);
        }
        Ok(out)
    }

    async fn assign_batch(&self, batch_id: BatchId) -> Result<usize, StorageError> {
        let res = sqlx::query(
            r"
                UPDATE offline_queue
                SET batch_id = ?1
                WHERE acked = 0 AND batch_id IS NULL
            ",
        )
        .bind(batch_id.to_string())
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(usize::try_from(res.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn mark_acked(&self, batch_id: BatchId) -> Result<usize, StorageError> {
        let res = sqlx::query(
            r"
                UPDATE offline_queue
                SET acked = 1
                WHERE batch_id = ?1 AND acked = 0
            ",
        )
        .bind(batch_id.to_string())
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(usize::try_from(res.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn purge_oldest_acked(&self, max: usize) -> Result<usize, StorageError> {
        let limit = i64::try_from(max).unwrap_or(i64::MAX);

        let res = sqlx::query(
            r"
                DELETE FROM offline_queue
                WHERE local_seq IN (
                    SELECT local_seq FROM offline_queue
                    WHERE acked = 1
                    ORDER BY local_seq ASC
                    LIMIT ?1
                )
            ",
        )
        .bind(limit)
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(usize::try_from(res.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn len(&self) -> Result<usize, StorageError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM offline_queue")
            .fetch_one(self.pool())
            .await
            .map_err(unavailable)?;

        Ok(usize::try_from(count).unwrap_or(0))
    }
}
