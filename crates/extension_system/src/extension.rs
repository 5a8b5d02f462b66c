//! Extension contract and the API surface handed to extension code

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ExtensionError, Result};
use crate::manifest::{Capability, ExtensionManifest};
use crate::message::HookMessage;
use crate::tools::{SharedTool, ToolRegistry};

/// Lifecycle and hook methods of an extension. Every method is optional.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn on_load(&self, _api: &ExtensionApi) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_enable(&self, _api: &ExtensionApi) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_disable(&self, _api: &ExtensionApi) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs before the pipeline consumes user input.
    async fn on_message(
        &self,
        message: HookMessage,
        _api: &ExtensionApi,
    ) -> anyhow::Result<HookMessage> {
        Ok(message)
    }

    /// Runs after the model response has been parsed.
    async fn on_response(
        &self,
        message: HookMessage,
        _api: &ExtensionApi,
    ) -> anyhow::Result<HookMessage> {
        Ok(message)
    }

    async fn on_settings_change(&self, _settings: &Value, _api: &ExtensionApi) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_unload(&self, _api: &ExtensionApi) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The only handle extension code gets to the host.
///
/// Every call is checked against the capabilities in the manifest.
#[derive(Clone)]
pub struct ExtensionApi {
    extension_id: String,
    capabilities: HashSet<Capability>,
    tools: Arc<ToolRegistry>,
    settings: Arc<Mutex<Value>>,
    registered_tools: Arc<Mutex<Vec<String>>>,
}

impl ExtensionApi {
    pub(crate) fn new(manifest: &ExtensionManifest, tools: Arc<ToolRegistry>, settings: Value) -> Self {
        Self {
            extension_id: manifest.id.clone(),
            capabilities: manifest.capabilities.iter().copied().collect(),
            tools,
            settings: Arc::new(Mutex::new(settings)),
            registered_tools: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    fn require(&self, capability: Capability) -> Result<()> {
        if self.has_capability(capability) {
            Ok(())
        } else {
            Err(ExtensionError::CapabilityDenied {
                extension: self.extension_id.clone(),
                capability,
            })
        }
    }

    pub fn register_tool(&self, tool: SharedTool) -> Result<()> {
        self.require(Capability::Tools)?;
        let name = tool.name().trim().to_string();
        self.tools.register_shared(tool)?;
        log::info!("Extension '{}' registered tool '{}'", self.extension_id, name);
        self.registered_tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name);
        Ok(())
    }

    pub fn settings(&self) -> Result<Value> {
        self.require(Capability::Settings)?;
        Ok(self
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    pub(crate) fn replace_settings(&self, settings: Value) {
        *self.settings.lock().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// Remove every tool this extension registered.
    pub(crate) fn release_tools(&self) {
        let names = std::mem::take(
            &mut *self
                .registered_tools
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for name in names {
            if self.tools.unregister(&name) {
                log::debug!("Extension '{}' released tool '{}'", self.extension_id, name);
            }
        }
    }

    /// Write to the host log under the extension's id.
    pub fn log(&self, level: log::Level, message: &str) {
        log::log!(level, "[extension:{}] {}", self.extension_id, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{Tool, ToolError, ToolExecutionContext, ToolParams};

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, _context: &ToolExecutionContext, params: ToolParams) -> std::result::Result<String, ToolError> {
            Ok(params.raw().to_string())
        }
    }

    #[test]
    fn tools_are_released_after_a_poisoned_lock() {
        let manifest = ExtensionManifest::new("echoer", "Echoer", "1.0.0", "echoer")
            .with_capabilities([Capability::Tools]);
        let tools = Arc::new(ToolRegistry::new());
        let api = ExtensionApi::new(&manifest, tools.clone(), Value::Null);

        let poisoner = api.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.registered_tools.lock().unwrap();
            panic!("poison the tool list");
        })
        .join();
        assert!(api.registered_tools.is_poisoned());

        api.register_tool(Arc::new(Echo)).unwrap();
        assert!(tools.contains("echo"));

        api.release_tools();
        assert!(tools.is_empty());
    }
}
