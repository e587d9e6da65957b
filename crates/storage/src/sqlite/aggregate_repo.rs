use progress_core::model::{
    CourseId, CourseProgress, LessonId, LessonProgress, SectionId, SectionProgress, UserId,
};

use super::{
    SqliteRepository,
    mapping::{
        id_i64, map_course_row, map_lesson_row, map_section_row, sequence_to_i64, unavailable,
    },
};
use crate::repository::{AggregateRepository, StorageError};

#[async_trait::async_trait]
impl AggregateRepository for SqliteRepository {
    async fn upsert_section(&self, progress: &SectionProgress) -> Result<(), StorageError> {
        let user_id = id_i64("user_id", progress.user_id().value())?;
        let section_id = id_i64("section_id", progress.section_id().value())?;
        let last_event_seq = progress
            .last_event_seq()
            .map(sequence_to_i64)
            .transpose()?;

        sqlx::query(
            r"
                INSERT INTO section_progress (
                    user_id, section_id, completed, time_spent_ms, best_score, last_event_seq
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(user_id, section_id) DO UPDATE SET
                    completed = excluded.completed,
                    time_spent_ms = excluded.time_spent_ms,
                    best_score = excluded.best_score,
                    last_event_seq = excluded.last_event_seq
            ",
        )
        .bind(user_id)
        .bind(section_id)
        .bind(progress.completed())
        .bind(progress.time_spent_total().num_milliseconds())
        .bind(progress.best_score())
        .bind(last_event_seq)
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn get_section(
        &self,
        user_id: UserId,
        section_id: SectionId,
    ) -> Result<Option<SectionProgress>, StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let section = id_i64("section_id", section_id.value())?;

        let row = sqlx::query(
            r"
                SELECT user_id, section_id, completed, time_spent_ms, best_score, last_event_seq
                FROM section_progress
                WHERE user_id = ?1 AND section_id = ?2
            ",
        )
        .bind(user)
        .bind(section)
        .fetch_optional(self.pool())
        .await
        .map_err(unavailable)?;

        row.map(|r| map_section_row(&r)).transpose()
    }

    async fn upsert_lesson(&self, progress: &LessonProgress) -> Result<(), StorageError> {
        let user_id = id_i64("user_id", progress.user_id().value())?;
        let lesson_id = id_i64("lesson_id", progress.lesson_id().value())?;

        sqlx::query(
            r"
                INSERT INTO lesson_progress (
                    user_id, lesson_id, completed_section_count, total_section_count, completed
                )
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(user_id, lesson_id) DO UPDATE SET
                    completed_section_count = excluded.completed_section_count,
                    total_section_count = excluded.total_section_count,
                    completed = excluded.completed
            ",
        )
        .bind(user_id)
        .bind(lesson_id)
        .bind(i64::from(progress.completed_section_count()))
        .bind(i64::from(progress.total_section_count()))
        .bind(progress.completed())
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn get_lesson(
        &self,
        user_id: UserId,
        lesson_id: LessonId,
    ) -> Result<Option<LessonProgress>, StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let lesson = id_i64("lesson_id", lesson_id.value())?;

        let row = sqlx::query(
            r"
                SELECT user_id, lesson_id, completed_section_count, total_section_count, completed
                FROM lesson_progress
                WHERE user_id = ?1 AND lesson_id = ?2
            ",
        )
        .bind(user)
        .bind(lesson)
        .fetch_optional(self.pool())
        .await
        .map_err(unavailable)?;

        row.map(|r| map_lesson_row(&r)).transpose()
    }

    async fn upsert_course(&self, progress: &CourseProgress) -> Result<(), StorageError> {
        let user_id = id_i64("user_id", progress.user_id().value())?;
        let course_id = id_i64("course_id", progress.course_id().value())?;

        sqlx::query(
            r"
                INSERT INTO course_progress (
                    user_id, course_id, completed_lesson_count, total_lesson_count,
                    completion_percentage, completed, completed_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(user_id, course_id) DO UPDATE SET
                    completed_lesson_count = excluded.completed_lesson_count,
                    total_lesson_count = excluded.total_lesson_count,
                    completion_percentage = excluded.completion_percentage,
                    completed = excluded.completed,
                    completed_at = excluded.completed_at
            ",
        )
        .bind(user_id)
        .bind(course_id)
        .bind(i64::from(progress.completed_lesson_count()))
        .bind(i64::from(progress.total_lesson_count()))
        .bind(progress.completion_percentage())
        .bind(progress.completed())
        .bind(progress.completed_at())
        .execute(self.pool())
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn get_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<Option<CourseProgress>, StorageError> {
        let user = id_i64("user_id", user_id.value())?;
        let course = id_i64("course_id", course_id.value())?;

        let row = sqlx::query(
            r"
                SELECT user_id, course_id, completed_lesson_count, total_lesson_count,
                       completion_percentage, completed, completed_at
                FROM course_progress
                WHERE user_id = ?1 AND course_id = ?2
            ",
        )
        .bind(user)
        .bind(course)
        .fetch_optional(self.pool())
        .await
        .map_err(unavailable)?;

        row.map(|r| map_course_row(&r)).transpose()
    }
}
