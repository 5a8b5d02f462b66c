//! Pipeline Errors
//!
//! `PipelineError` is raised while building a pipeline from stage
//! descriptors. `StageError` is raised by a single stage at run time and is
//! reported in the run result together with the failing stage id.

use thiserror::Error;

/// Errors in the declared stage graph.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    /// No stages registered
    #[error("No stages registered in pipeline")]
    NoStages,

    #[error("Stage '{0}' registered twice")]
    DuplicateStage(String),

    #[error("Entry stage '{0}' is not registered")]
    MissingEntry(String),

    #[error("Stage '{stage}' names unknown successor '{next}'")]
    UnknownSuccessor { stage: String, next: String },

    #[error("Stage graph contains a cycle through '{0}'")]
    Cycle(String),

    #[error("Stage '{stage}' declares invalid fields: {reason}")]
    InvalidFields { stage: String, reason: String },
}

/// Errors returned by a model backend.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors raised by one stage execution.
#[derive(Debug, Error)]
pub enum StageError {
    /// A required input field was not present in the context
    #[error("Missing required input field '{0}'")]
    MissingInput(String),

    /// An input field had an unexpected shape
    #[error("Invalid value for field '{field}': {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Model call timed out after {0}s")]
    Timeout(u64),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    /// Generic stage failure
    #[error("Stage failed: {0}")]
    Failed(String),
}

impl StageError {
    pub fn failed(reason: impl Into<String>) -> Self {
        StageError::Failed(reason.into())
    }
}
