use rollcall_core::detector::DetectorError;
use rollcall_core::imaging::ImagingError;
use thiserror::Error;
use uuid::Uuid;

use crate::source::SourceError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no usable training data for cohort '{cohort}'")]
    NoTrainingData { cohort: String },
    #[error("session {0} not found")]
    SessionNotFound(Uuid),
    #[error("frame error: {0}")]
    Frame(#[from] ImagingError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("training source error: {0}")]
    Source(#[from] SourceError),
    #[error("background task failed: {0}")]
    Task(String),
}
