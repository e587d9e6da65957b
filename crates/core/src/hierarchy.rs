//! Read-only view of the course → lesson → section content hierarchy.
//!
//! The hierarchy is owned by the content collaborator; the engine only looks
//! up parent/child relations and treats the answers as eventually consistent
//! with authoring changes.

use chrono::Duration;
use std::collections::HashMap;

use crate::model::{CourseId, LessonId, SectionId};

/// The lesson and course a section belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionParents {
    pub lesson_id: LessonId,
    pub course_id: CourseId,
}

/// Lookup contract supplied by the content collaborator.
pub trait ContentHierarchy: Send + Sync {
    /// Parents of a section, or `None` for a section the hierarchy does not
    /// know (orphaned or unknown reference).
    fn section_parents(&self, section_id: SectionId) -> Option<SectionParents>;

    /// Sections belonging to a lesson, in authored order.
    fn lesson_sections(&self, lesson_id: LessonId) -> Vec<SectionId>;

    /// Lessons belonging to a course, in authored order.
    fn course_lessons(&self, course_id: CourseId) -> Vec<LessonId>;

    /// Authored estimate of how long the lesson takes, when known. Used to
    /// bound plausible time-spent deltas.
    fn lesson_estimated_duration(&self, lesson_id: LessonId) -> Option<Duration>;
}

/// Map-backed hierarchy for tests and embedded use.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHierarchy {
    section_parents: HashMap<SectionId, SectionParents>,
    lesson_sections: HashMap<LessonId, Vec<SectionId>>,
    course_lessons: HashMap<CourseId, Vec<LessonId>>,
    lesson_durations: HashMap<LessonId, Duration>,
}

impl InMemoryHierarchy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a lesson with its sections under a course.
    #[must_use]
    pub fn with_lesson(
        mut self,
        course_id: CourseId,
        lesson_id: LessonId,
        sections: &[SectionId],
    ) -> Self {
        for &section_id in sections {
            self.section_parents.insert(
                section_id,
                SectionParents {
                    lesson_id,
                    course_id,
                },
            );
        }
        self.lesson_sections
            .insert(lesson_id, sections.to_vec());
        self.course_lessons
            .entry(course_id)
            .or_default()
            .push(lesson_id);
        self
    }

    /// Sets the authored duration estimate for a lesson.
    #[must_use]
    pub fn with_estimated_duration(mut self, lesson_id: LessonId, duration: Duration) -> Self {
        self.lesson_durations.insert(lesson_id, duration);
        self
    }
}

impl ContentHierarchy for InMemoryHierarchy {
    fn section_parents(&self, section_id: SectionId) -> Option<SectionParents> {
        self.section_parents.get(&section_id).copied()
    }

    fn lesson_sections(&self, lesson_id: LessonId) -> Vec<SectionId> {
        self.lesson_sections
            .get(&lesson_id)
            .cloned()
            .unwrap_or_default()
    }

    fn course_lessons(&self, course_id: CourseId) -> Vec<LessonId> {
        self.course_lessons
            .get(&course_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lesson_estimated_duration(&self, lesson_id: LessonId) -> Option<Duration> {
        self.lesson_durations.get(&lesson_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_lessons_and_parents() {
        let course = CourseId::new(1);
        let lesson = LessonId::new(10);
        let sections = [SectionId::new(100), SectionId::new(101)];

        let hierarchy = InMemoryHierarchy::new().with_lesson(course, lesson, &sections);

        assert_eq!(hierarchy.course_lessons(course), vec![lesson]);
        assert_eq!(hierarchy.lesson_sections(lesson), sections.to_vec());
        assert_eq!(
            hierarchy.section_parents(SectionId::new(100)),
            Some(SectionParents {
                lesson_id: lesson,
                course_id: course
            })
        );
        assert_eq!(hierarchy.section_parents(SectionId::new(999)), None);
    }

    #[test]
    fn duration_estimate_is_optional() {
        let lesson = LessonId::new(10);
        let hierarchy = InMemoryHierarchy::new()
            .with_estimated_duration(lesson, Duration::minutes(20));

        assert_eq!(
            hierarchy.lesson_estimated_duration(lesson),
            Some(Duration::minutes(20))
        );
        assert_eq!(
            hierarchy.lesson_estimated_duration(LessonId::new(11)),
            None
        );
    }
}
