use progress_core::model::UserId;

use super::{
    SqliteRepository,
    mapping::{id_i64, map_dead_letter_row, reason_to_str, unavailable},
};
use crate::repository::{DeadLetter, DeadLetterRepository, StorageError};

#[async_trait::async_trait]
impl DeadLetterRepository for SqliteRepository {
    async fn push_letter(&self, letter: &DeadLetter) -> Result<(), StorageError> {
        let user = id_i64("user_id", letter.user_id.value())?;

        sqlx::query(
            r"
                INSERT INTO dead_letters (event_id, user_id, reason, detail, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(letter.event_id.to_string())
        .bind(user)
        .bind(reason_to_str(letter.reason))
        .bind(letter.detail.as_str())
        .bind(letter.recorded_at)
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn letters_for_user(&self, user_id: UserId) -> Result<Vec<DeadLetter>, StorageError> {
        let user = id_i64("user_id", user_id.value())?;

        let rows = sqlx::query(
            r"
                SELECT event_id, user_id, reason, detail, recorded_at
                FROM dead_letters
                WHERE user_id = ?1
                ORDER BY recorded_at ASC, id ASC
            ",
        )
        .bind(user)
        .fetch_all(self.pool())
        .await
        .map_err(unavailable)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(map_dead_letter_row(&row)?);
        }
        Ok(out)
    }
}
