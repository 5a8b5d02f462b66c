use storage_manager::StorageError;
use thiserror::Error;

/// Errors surfaced by the conversation tree store.
///
/// Missing trees or turns are not errors; lookups return `None` instead.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("stored tree is malformed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ContextError>;
