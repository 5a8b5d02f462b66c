//! Extensions bundled with the CLI

use std::sync::Arc;

use async_trait::async_trait;
use extension_system::{
    Capability, Extension, ExtensionApi, ExtensionLoader, ExtensionManifest, Tool, ToolError,
    ToolExecutionContext, ToolParams,
};
use serde_json::Value;

pub const CORE_TOOLS_ID: &str = "core-tools";

/// `{{var::gold}}` → the current value of `gold`.
struct VariableLookup;

#[async_trait]
impl Tool for VariableLookup {
    fn name(&self) -> &str {
        "var"
    }

    fn description(&self) -> &str {
        "Insert the current value of a variable"
    }

    async fn execute(&self, context: &ToolExecutionContext, params: ToolParams) -> Result<String, ToolError> {
        let name = params.raw().trim();
        if name.is_empty() {
            return Err(ToolError::InvalidParams("variable name required".to_string()));
        }
        match context.variables.get(name) {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(value) => Ok(value.to_string()),
            None => Err(ToolError::ExecutionFailed(format!("unknown variable '{name}'"))),
        }
    }
}

struct CoreTools;

#[async_trait]
impl Extension for CoreTools {
    async fn on_load(&self, api: &ExtensionApi) -> anyhow::Result<()> {
        api.register_tool(Arc::new(VariableLookup))?;
        Ok(())
    }
}

pub fn register(loader: &mut ExtensionLoader) {
    loader.register(CORE_TOOLS_ID, || CoreTools);
}

pub fn core_tools_manifest() -> ExtensionManifest {
    ExtensionManifest::new(CORE_TOOLS_ID, "Core tools", "0.1.0", CORE_TOOLS_ID)
        .with_capabilities([Capability::Tools])
}
