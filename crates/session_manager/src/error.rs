//! Session service error types

use context_manager::ContextError;
use pipeline_system::{PipelineError, StageError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Tree store error: {0}")]
    Context(#[from] ContextError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("Cancelled before stage '{stage}'")]
    Cancelled { stage: String },

    #[error("Pipeline output field '{field}' is missing or malformed")]
    InvalidOutput { field: String },
}

pub type Result<T> = std::result::Result<T, ServiceError>;
