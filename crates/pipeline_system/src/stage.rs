//! Stage contract
//!
//! A stage declares the context fields it reads and writes. The engine hands
//! it only its declared inputs and keeps only its declared outputs, so a stage
//! can be tested with a plain field map.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StageError;

/// Field-keyed values threaded through one pipeline run.
pub type FieldMap = serde_json::Map<String, Value>;

/// Static description of a stage's place in the graph and its field contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub id: String,
    /// Fields that must be present in the context before the stage runs.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Fields passed through when present.
    #[serde(default)]
    pub optional_inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Stage-local field name to context field name.
    #[serde(default)]
    pub rename: HashMap<String, String>,
    /// Successor stage ids.
    #[serde(default)]
    pub next: Vec<String>,
}

impl StageDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn inputs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn optional_inputs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional_inputs = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn outputs<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Read and write the stage-local field `local` under `context` in the
    /// pipeline context.
    pub fn rename(mut self, local: impl Into<String>, context: impl Into<String>) -> Self {
        self.rename.insert(local.into(), context.into());
        self
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.next.push(next.into());
        self
    }

    /// Context field name for a stage-local field.
    pub fn context_field<'a>(&'a self, local: &'a str) -> &'a str {
        self.rename.get(local).map(String::as_str).unwrap_or(local)
    }
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn descriptor(&self) -> &StageDescriptor;

    /// Transform the projected inputs into outputs.
    ///
    /// Keys in the returned map that are not declared outputs are dropped.
    async fn transform(&self, input: FieldMap) -> Result<FieldMap, StageError>;
}

/// Typed accessors over a projected field map.
pub trait FieldMapExt {
    fn require(&self, field: &str) -> Result<&Value, StageError>;
    fn require_str(&self, field: &str) -> Result<&str, StageError>;
    fn opt_str(&self, field: &str) -> Option<&str>;
}

impl FieldMapExt for FieldMap {
    fn require(&self, field: &str) -> Result<&Value, StageError> {
        self.get(field)
            .ok_or_else(|| StageError::MissingInput(field.to_string()))
    }

    fn require_str(&self, field: &str) -> Result<&str, StageError> {
        self.require(field)?
            .as_str()
            .ok_or_else(|| StageError::InvalidInput {
                field: field.to_string(),
                reason: "expected a string".to_string(),
            })
    }

    fn opt_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }
}
