use thiserror::Error;

use crate::model::{EngineSettingsError, EventError, ProgressError};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Settings(#[from] EngineSettingsError),
}
