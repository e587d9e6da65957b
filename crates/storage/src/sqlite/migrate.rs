use chrono::Utc;
use sqlx::SqlitePool;

use super::SqliteInitError;

/// Runs a single, consolidated migration for the current schema.
///
/// Creates the full schema: the append-only event log, the three disposable
/// progress projections, the sync-batch dedup ledger, the dead-letter set,
/// the client-side offline queue, and indexes on the read paths.
#[allow(clippy::too_many_lines)]
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), SqliteInitError> {
    async fn is_applied(pool: &SqlitePool, version: i64) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_optional(pool)
            .await?;
        Ok(row.is_some())
    }

    sqlx::query(
        r"
            CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );
            ",
    )
    .execute(pool)
    .await?;

    // Version 1: full schema.
    if !is_applied(pool, 1).await? {
        let mut tx = pool.begin().await?;

        // The source of truth. Sequences are per (user_id, section_id)
        // stream; the unique event_id is the idempotency key for appends.
        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS progress_events (
                    user_id INTEGER NOT NULL,
                    section_id INTEGER NOT NULL,
                    server_sequence INTEGER NOT NULL CHECK (server_sequence >= 1),
                    event_id TEXT NOT NULL UNIQUE,
                    lesson_id INTEGER NOT NULL,
                    course_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    time_spent_ms INTEGER CHECK (time_spent_ms IS NULL OR time_spent_ms >= 0),
                    score REAL,
                    client_timestamp TEXT NOT NULL,
                    ingested_at TEXT NOT NULL,
                    PRIMARY KEY (user_id, section_id, server_sequence)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS section_progress (
                    user_id INTEGER NOT NULL,
                    section_id INTEGER NOT NULL,
                    completed INTEGER NOT NULL CHECK (completed IN (0, 1)),
                    time_spent_ms INTEGER NOT NULL CHECK (time_spent_ms >= 0),
                    best_score REAL,
                    last_event_seq INTEGER,
                    PRIMARY KEY (user_id, section_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS lesson_progress (
                    user_id INTEGER NOT NULL,
                    lesson_id INTEGER NOT NULL,
                    completed_section_count INTEGER NOT NULL CHECK (completed_section_count >= 0),
                    total_section_count INTEGER NOT NULL CHECK (total_section_count >= completed_section_count),
                    completed INTEGER NOT NULL CHECK (completed IN (0, 1)),
                    PRIMARY KEY (user_id, lesson_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS course_progress (
                    user_id INTEGER NOT NULL,
                    course_id INTEGER NOT NULL,
                    completed_lesson_count INTEGER NOT NULL CHECK (completed_lesson_count >= 0),
                    total_lesson_count INTEGER NOT NULL CHECK (total_lesson_count >= completed_lesson_count),
                    completion_percentage REAL NOT NULL,
                    completed INTEGER NOT NULL CHECK (completed IN (0, 1)),
                    completed_at TEXT,
                    PRIMARY KEY (user_id, course_id)
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS sync_batches (
                    batch_id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    result_json TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS dead_letters (
                    id INTEGER PRIMARY KEY,
                    event_id TEXT NOT NULL,
                    user_id INTEGER NOT NULL,
                    reason TEXT NOT NULL,
                    detail TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE TABLE IF NOT EXISTS offline_queue (
                    local_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    batch_id TEXT,
                    acked INTEGER NOT NULL DEFAULT 0 CHECK (acked IN (0, 1)),
                    event_id TEXT NOT NULL,
                    user_id INTEGER NOT NULL,
                    section_id INTEGER NOT NULL,
                    lesson_id INTEGER NOT NULL,
                    course_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    time_spent_ms INTEGER,
                    score REAL,
                    client_timestamp TEXT NOT NULL
                );
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_progress_events_stream
                    ON progress_events (user_id, section_id, server_sequence);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_sync_batches_recorded
                    ON sync_batches (recorded_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_dead_letters_user_recorded
                    ON dead_letters (user_id, recorded_at);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                CREATE INDEX IF NOT EXISTS idx_offline_queue_acked_seq
                    ON offline_queue (acked, local_seq);
            ",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"
                INSERT INTO schema_migrations (version, applied_at)
                VALUES (?1, ?2)
                ON CONFLICT(version) DO NOTHING
            ",
        )
        .bind(1_i64)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
    }

    Ok(())
}
