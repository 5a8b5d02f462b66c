//! Tools invoked inline from model responses

pub mod grammar;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use grammar::{detect_tool_calls, ToolCall, ToolCallSyntax};
pub use registry::{RegistryError, SharedTool, ToolRegistry};

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Invalid parameters provided to tool: {0}")]
    InvalidParams(String),
    #[error("Tool execution failed: {0}")]
    ExecutionFailed(String),
    #[error(transparent)]
    InternalError(#[from] anyhow::Error),
}

/// Where a tool call was found.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolExecutionContext {
    pub tree_id: Option<String>,
    pub turn_id: Option<String>,
    /// Resolved variables at the turn being answered.
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Raw parameter text of one tool call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParams {
    raw: String,
}

impl ToolParams {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.raw.trim().is_empty()
    }

    /// Whitespace-separated arguments.
    pub fn args(&self) -> Vec<&str> {
        self.raw.split_whitespace().collect()
    }

    /// Parameters as JSON, when the raw text is a JSON document.
    pub fn json(&self) -> Result<Value, ToolError> {
        serde_json::from_str(self.raw.trim())
            .map_err(|error| ToolError::InvalidParams(error.to_string()))
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Run the tool; the returned text replaces the call in the response.
    async fn execute(
        &self,
        context: &ToolExecutionContext,
        params: ToolParams,
    ) -> Result<String, ToolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_split_and_parse() {
        let params = ToolParams::new("  2d6  +3 ");
        assert_eq!(params.args(), vec!["2d6", "+3"]);
        assert!(params.json().is_err());

        let params = ToolParams::new(r#"{"sides": 20}"#);
        assert_eq!(params.json().unwrap()["sides"], 20);
        assert!(ToolParams::new("   ").is_empty());
    }
}
