use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{RecordStorage, Result};

/// Process-local storage, used by tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStorage for MemoryStorage {
    async fn read(&self, collection: &str) -> Result<Vec<Value>> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .cloned()
            .unwrap_or_default())
    }

    async fn write(&self, collection: &str, records: Vec<Value>) -> Result<()> {
        self.collections
            .write()
            .await
            .insert(collection.to_string(), records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn missing_collection_reads_empty() {
        let storage = MemoryStorage::new();
        assert!(storage.read("nothing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_replaces_collection() {
        let storage = MemoryStorage::new();
        storage.write("c", vec![json!(1), json!(2)]).await.unwrap();
        storage.write("c", vec![json!(3)]).await.unwrap();
        assert_eq!(storage.read("c").await.unwrap(), vec![json!(3)]);
    }
}
