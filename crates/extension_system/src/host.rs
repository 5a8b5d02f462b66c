//! Extension host
//!
//! Owns loaded extensions in registration order and drives their lifecycle:
//! load → enable ⇄ disable → unload. Hooks are called without holding the
//! extension list lock.

use std::sync::Arc;

use log::{info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{ExtensionError, Result};
use crate::extension::{Extension, ExtensionApi};
use crate::loader::ExtensionLoader;
use crate::manifest::{Capability, ExtensionManifest};
use crate::tools::ToolRegistry;

struct LoadedExtension {
    manifest: ExtensionManifest,
    extension: Arc<dyn Extension>,
    api: ExtensionApi,
    enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtensionSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub capabilities: Vec<Capability>,
}

/// An enabled extension selected for a hook point.
#[derive(Clone)]
pub(crate) struct ActiveExtension {
    pub id: String,
    pub extension: Arc<dyn Extension>,
    pub api: ExtensionApi,
}

pub struct ExtensionHost {
    loader: ExtensionLoader,
    tools: Arc<ToolRegistry>,
    extensions: RwLock<Vec<LoadedExtension>>,
}

fn hook_error(extension: &str, hook: &'static str, source: anyhow::Error) -> ExtensionError {
    ExtensionError::Hook {
        extension: extension.to_string(),
        hook,
        source,
    }
}

impl ExtensionHost {
    pub fn new(loader: ExtensionLoader, tools: Arc<ToolRegistry>) -> Self {
        Self {
            loader,
            tools,
            extensions: RwLock::new(Vec::new()),
        }
    }

    pub fn tools(&self) -> Arc<ToolRegistry> {
        Arc::clone(&self.tools)
    }

    async fn handle(&self, id: &str) -> Result<(Arc<dyn Extension>, ExtensionApi, bool)> {
        let extensions = self.extensions.read().await;
        extensions
            .iter()
            .find(|loaded| loaded.manifest.id == id)
            .map(|loaded| (Arc::clone(&loaded.extension), loaded.api.clone(), loaded.enabled))
            .ok_or_else(|| ExtensionError::NotLoaded(id.to_string()))
    }

    async fn set_enabled(&self, id: &str, enabled: bool) {
        let mut extensions = self.extensions.write().await;
        if let Some(loaded) = extensions.iter_mut().find(|loaded| loaded.manifest.id == id) {
            loaded.enabled = enabled;
        }
    }

    /// Validate, instantiate and load an extension. It starts disabled.
    pub async fn load(&self, manifest: ExtensionManifest, settings: Value) -> Result<()> {
        if self
            .extensions
            .read()
            .await
            .iter()
            .any(|loaded| loaded.manifest.id == manifest.id)
        {
            return Err(ExtensionError::AlreadyLoaded(manifest.id));
        }

        let extension = self.loader.instantiate(&manifest)?;
        let api = ExtensionApi::new(&manifest, Arc::clone(&self.tools), settings);
        if let Err(error) = extension.on_load(&api).await {
            api.release_tools();
            return Err(hook_error(&manifest.id, "on_load", error));
        }

        info!(
            "Loaded extension '{}' v{} ({})",
            manifest.id, manifest.version, manifest.name
        );
        let mut extensions = self.extensions.write().await;
        if extensions.iter().any(|loaded| loaded.manifest.id == manifest.id) {
            api.release_tools();
            return Err(ExtensionError::AlreadyLoaded(manifest.id));
        }
        extensions.push(LoadedExtension {
            manifest,
            extension,
            api,
            enabled: false,
        });
        Ok(())
    }

    pub async fn enable(&self, id: &str) -> Result<()> {
        let (extension, api, enabled) = self.handle(id).await?;
        if enabled {
            return Ok(());
        }
        extension
            .on_enable(&api)
            .await
            .map_err(|error| hook_error(id, "on_enable", error))?;
        self.set_enabled(id, true).await;
        info!("Enabled extension '{}'", id);
        Ok(())
    }

    /// Disable an extension. It stops receiving hooks even if `on_disable` fails.
    pub async fn disable(&self, id: &str) -> Result<()> {
        let (extension, api, enabled) = self.handle(id).await?;
        if !enabled {
            return Ok(());
        }
        self.set_enabled(id, false).await;
        info!("Disabled extension '{}'", id);
        extension
            .on_disable(&api)
            .await
            .map_err(|error| hook_error(id, "on_disable", error))
    }

    /// Unload an extension and drop the tools it registered. Hook failures
    /// during unload are logged only.
    pub async fn unload(&self, id: &str) -> Result<()> {
        let (extension, api, enabled) = self.handle(id).await?;
        if enabled {
            if let Err(error) = extension.on_disable(&api).await {
                warn!("Extension '{}' failed in on_disable: {:#}", id, error);
            }
        }
        if let Err(error) = extension.on_unload(&api).await {
            warn!("Extension '{}' failed in on_unload: {:#}", id, error);
        }
        api.release_tools();
        self.extensions
            .write()
            .await
            .retain(|loaded| loaded.manifest.id != id);
        info!("Unloaded extension '{}'", id);
        Ok(())
    }

    pub async fn update_settings(&self, id: &str, settings: Value) -> Result<()> {
        let (extension, api, _) = self.handle(id).await?;
        api.replace_settings(settings.clone());
        extension
            .on_settings_change(&settings, &api)
            .await
            .map_err(|error| hook_error(id, "on_settings_change", error))
    }

    pub async fn list(&self) -> Vec<ExtensionSummary> {
        self.extensions
            .read()
            .await
            .iter()
            .map(|loaded| ExtensionSummary {
                id: loaded.manifest.id.clone(),
                name: loaded.manifest.name.clone(),
                version: loaded.manifest.version.clone(),
                enabled: loaded.enabled,
                capabilities: loaded.manifest.capabilities.clone(),
            })
            .collect()
    }

    /// Enabled extensions granted `capability`, in registration order.
    pub(crate) async fn active_for(&self, capability: Capability) -> Vec<ActiveExtension> {
        self.extensions
            .read()
            .await
            .iter()
            .filter(|loaded| loaded.enabled && loaded.manifest.grants(capability))
            .map(|loaded| ActiveExtension {
                id: loaded.manifest.id.clone(),
                extension: Arc::clone(&loaded.extension),
                api: loaded.api.clone(),
            })
            .collect()
    }
}
