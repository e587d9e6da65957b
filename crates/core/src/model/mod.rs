mod batch;
mod engine_settings;
mod event;
mod ids;
mod progress;

pub use ids::{
    BatchId, CourseId, EventId, LessonId, ParseIdError, SectionId, SequenceNumber, UserId,
};

pub use batch::{RejectReason, SyncBatch, SyncResult};
pub use engine_settings::{EngineSettings, EngineSettingsDraft, EngineSettingsError};
pub use event::{EventError, EventKind, ProgressEvent, SequencedEvent};
pub use progress::{CourseProgress, LessonProgress, ProgressError, SectionProgress};
