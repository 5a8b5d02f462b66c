//! Extension manifests
//!
//! A manifest names the extension, the entry point its factory is registered
//! under, and the capabilities the host may grant it.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ExtensionError, Result};

static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("Failed to compile extension id regex"));
static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+$").expect("Failed to compile extension version regex")
});

/// What an extension is allowed to touch through its `ExtensionApi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Receive `on_message` hooks.
    Messages,
    /// Receive `on_response` hooks.
    Responses,
    /// Register tools for inline invocation.
    Tools,
    /// Read its own settings.
    Settings,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Messages => "messages",
            Capability::Responses => "responses",
            Capability::Tools => "tools",
            Capability::Settings => "settings",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub entry_point: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
}

impl ExtensionManifest {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            entry_point: entry_point.into(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !ID_PATTERN.is_match(&self.id) {
            return Err(ExtensionError::InvalidManifest(format!(
                "id '{}' must match [a-z0-9-]+",
                self.id
            )));
        }
        if !VERSION_PATTERN.is_match(&self.version) {
            return Err(ExtensionError::InvalidManifest(format!(
                "version '{}' must be MAJOR.MINOR.PATCH",
                self.version
            )));
        }
        if self.name.trim().is_empty() {
            return Err(ExtensionError::InvalidManifest(
                "name cannot be empty".to_string(),
            ));
        }
        if self.entry_point.trim().is_empty() {
            return Err(ExtensionError::InvalidManifest(
                "entry point cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(id: &str, version: &str) -> ExtensionManifest {
        ExtensionManifest::new(id, "Dice", version, "dice")
    }

    #[test]
    fn accepts_kebab_case_ids_and_semver() {
        assert!(manifest("dice-roller-2", "1.0.12").validate().is_ok());
    }

    #[test]
    fn rejects_bad_ids() {
        for id in ["Dice", "dice_roller", "", "dice roller"] {
            assert!(
                matches!(manifest(id, "1.0.0").validate(), Err(ExtensionError::InvalidManifest(_))),
                "id {id:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_bad_versions() {
        for version in ["1.0", "v1.0.0", "1.0.0-beta", "1..0"] {
            assert!(manifest("dice", version).validate().is_err(), "{version:?}");
        }
    }

    #[test]
    fn capabilities_deserialize_snake_case() {
        let manifest: ExtensionManifest = serde_json::from_str(
            r#"{"id":"x","name":"X","version":"0.1.0","entry_point":"x","capabilities":["messages","tools"]}"#,
        )
        .unwrap();
        assert!(manifest.grants(Capability::Tools));
        assert!(!manifest.grants(Capability::Responses));
    }
}
