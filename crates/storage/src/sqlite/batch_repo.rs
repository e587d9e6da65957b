use chrono::{DateTime, Utc};

use progress_core::model::{BatchId, SyncResult, UserId};

use super::{
    SqliteRepository,
    mapping::{id_i64, ser, unavailable},
};
use crate::repository::{BatchLedger, StorageError};

#[async_trait::async_trait]
impl BatchLedger for SqliteRepository {
    async fn record_batch(
        &self,
        batch_id: BatchId,
        user_id: UserId,
        result: &SyncResult,
        recorded_at: DateTime<Utc>,
        window: usize,
    ) -> Result<(), StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let result_json = serde_json::to_string(result).map_err(ser)?;
        let window = i64::try_from(window).unwrap_or(i64::MAX);

        let mut tx = self.pool().begin().await.map_err(unavailable)?;

        sqlx::query(
            r"
                INSERT INTO sync_batches (batch_id, user_id, result_json, recorded_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(batch_id) DO UPDATE SET
                    result_json = excluded.result_json,
                    recorded_at = excluded.recorded_at
            ",
        )
        .bind(batch_id.to_string())
        .bind(user)
        .bind(result_json)
        .bind(recorded_at)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        // Bounded dedup window: only the most recent batches are retained.
        sqlx::query(
            r"
                DELETE FROM sync_batches
                WHERE batch_id NOT IN (
                    SELECT batch_id FROM sync_batches
                    ORDER BY recorded_at DESC, rowid DESC
                    LIMIT ?1
                )
            ",
        )
        .bind(window)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    async fn lookup_batch(&self, batch_id: BatchId) -> Result<Option<SyncResult>, StorageError> {
        let row = sqlx::query_scalar::<_, String>(
            "SELECT result_json FROM sync_batches WHERE batch_id = ?1",
        )
        .bind(batch_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(unavailable)?;

        row.map(|json| serde_json::from_str(&json).map_err(ser))
            .transpose()
    }
}
