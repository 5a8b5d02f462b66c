use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;

use super::Tool;

pub type SharedTool = Arc<dyn Tool>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool with name '{0}' already registered")]
    DuplicateTool(String),

    #[error("invalid tool: {0}")]
    InvalidTool(String),
}

/// Name-keyed tools available to the tool-call pass.
///
/// Owned by the host and passed around explicitly; there is no process-wide
/// instance.
pub struct ToolRegistry {
    tools: DashMap<String, SharedTool>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    pub fn register<T>(&self, tool: T) -> Result<(), RegistryError>
    where
        T: Tool + 'static,
    {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&self, tool: SharedTool) -> Result<(), RegistryError> {
        let name = tool.name().trim();

        if name.is_empty() {
            return Err(RegistryError::InvalidTool(
                "tool name cannot be empty".to_string(),
            ));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(RegistryError::InvalidTool(format!(
                "tool name '{name}' cannot contain whitespace"
            )));
        }

        match self.tools.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateTool(name.to_string())),
            Entry::Vacant(entry) => {
                entry.insert(tool);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<SharedTool> {
        self.tools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn list_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolError, ToolExecutionContext, ToolParams};
    use async_trait::async_trait;

    struct EchoTool {
        name: &'static str,
    }

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(
            &self,
            _context: &ToolExecutionContext,
            params: ToolParams,
        ) -> Result<String, ToolError> {
            Ok(params.raw().to_string())
        }
    }

    #[test]
    fn register_and_get() {
        let registry = ToolRegistry::new();

        assert!(registry.register(EchoTool { name: "echo" }).is_ok());
        assert!(registry.get("echo").is_some());
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.list_tool_names(), vec!["echo".to_string()]);

        let tool = registry.get("echo").unwrap();
        let output = tokio_test::block_on(tool.execute(&ToolExecutionContext::default(), ToolParams::new("hi")));
        assert_eq!(output.unwrap(), "hi");
    }

    #[test]
    fn duplicate_tool_registration() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool { name: "dup" }).unwrap();

        let duplicate = registry.register(EchoTool { name: "dup" });
        assert!(matches!(duplicate, Err(RegistryError::DuplicateTool(name)) if name == "dup"));
    }

    #[test]
    fn rejects_empty_and_spaced_names() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.register(EchoTool { name: "  " }),
            Err(RegistryError::InvalidTool(_))
        ));
        assert!(matches!(
            registry.register(EchoTool { name: "two words" }),
            Err(RegistryError::InvalidTool(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unregister_removes_tool() {
        let registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo" }).unwrap();
        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert_eq!(registry.len(), 0);
    }
}
