use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ExtensionError, Result};
use crate::extension::Extension;
use crate::manifest::ExtensionManifest;

pub type ExtensionFactory = Arc<dyn Fn() -> Arc<dyn Extension> + Send + Sync>;

/// Maps manifest entry points to the code that builds the extension.
///
/// Factories are registered explicitly by the embedding application.
#[derive(Default, Clone)]
pub struct ExtensionLoader {
    factories: HashMap<String, ExtensionFactory>,
}

impl ExtensionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, E>(&mut self, entry_point: impl Into<String>, factory: F)
    where
        F: Fn() -> E + Send + Sync + 'static,
        E: Extension + 'static,
    {
        let factory: ExtensionFactory = Arc::new(move || Arc::new(factory()) as Arc<dyn Extension>);
        self.factories.insert(entry_point.into(), factory);
    }

    pub fn entry_points(&self) -> Vec<String> {
        let mut entry_points: Vec<String> = self.factories.keys().cloned().collect();
        entry_points.sort();
        entry_points
    }

    /// Validate `manifest` and instantiate its extension.
    pub fn instantiate(&self, manifest: &ExtensionManifest) -> Result<Arc<dyn Extension>> {
        manifest.validate()?;
        let factory = self
            .factories
            .get(&manifest.entry_point)
            .ok_or_else(|| ExtensionError::UnknownEntryPoint(manifest.entry_point.clone()))?;
        Ok(factory())
    }
}
