//! # Storage Manager
//!
//! The read/write collaborator behind the conversation tree store. A
//! collection is an ordered list of JSON records addressed by a key.

pub mod error;
pub mod file_storage;
pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

pub use error::{Result, StorageError};
pub use file_storage::FileStorage;
pub use memory::MemoryStorage;

/// Collection-keyed record storage.
#[async_trait]
pub trait RecordStorage: Send + Sync {
    /// Read every record of a collection. A missing collection is empty.
    async fn read(&self, collection: &str) -> Result<Vec<Value>>;

    /// Replace the full contents of a collection.
    async fn write(&self, collection: &str, records: Vec<Value>) -> Result<()>;
}
