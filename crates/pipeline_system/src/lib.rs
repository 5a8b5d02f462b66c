//! Staged message pipeline
//!
//! Stages declare the context fields they read and write; the [`Pipeline`]
//! engine orders them by their declared successors and enforces those
//! contracts on every run. The built-in chat stages live in [`stages`].

pub mod engine;
pub mod error;
pub mod result;
pub mod stage;
pub mod stages;

pub use engine::{Pipeline, PipelineBuilder};
pub use error::{ModelError, PipelineError, StageError};
pub use result::{ExecutionState, PipelineRun, ProcessingStats};
pub use stage::{FieldMap, FieldMapExt, Stage, StageDescriptor};
pub use stages::{default_pipeline, fields, ids, PipelineDeps};

pub use tokio_util::sync::CancellationToken;
