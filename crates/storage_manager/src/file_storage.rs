use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;

use crate::{RecordStorage, Result, StorageError};

/// One pretty-printed JSON array per collection under `base_path`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn collection_path(&self, collection: &str) -> Result<PathBuf> {
        let valid = !collection.is_empty()
            && collection
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StorageError::InvalidKey(collection.to_string()));
        }
        Ok(self.base_path.join(format!("{}.json", collection)))
    }
}

#[async_trait]
impl RecordStorage for FileStorage {
    async fn read(&self, collection: &str) -> Result<Vec<Value>> {
        let path = self.collection_path(collection)?;
        if !path.exists() {
            return Ok(Vec::new());
        }

        let contents = fs::read_to_string(&path).await?;
        match serde_json::from_str::<Value>(&contents)? {
            Value::Array(records) => Ok(records),
            _ => Err(StorageError::Corrupt {
                collection: collection.to_string(),
                reason: "expected a JSON array".to_string(),
            }),
        }
    }

    async fn write(&self, collection: &str, records: Vec<Value>) -> Result<()> {
        let path = self.collection_path(collection)?;
        fs::create_dir_all(&self.base_path).await?;

        let contents = serde_json::to_string_pretty(&Value::Array(records))?;
        // Atomic replace: write a sibling file, then rename it over the collection.
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, contents).await?;
        fs::rename(&tmp_path, &path).await?;

        tracing::debug!(collection = %collection, path = %path.display(), "FileStorage: collection written");
        Ok(())
    }
}
