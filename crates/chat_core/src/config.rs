use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::paths::{config_json_path, default_data_dir};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub extensions: ExtensionSettings,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Model backend settings handed to the model-invocation stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub model: String,
    pub api_base: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    /// Timeout around the model call only; `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: None,
            temperature: None,
            max_tokens: None,
            stream: false,
            timeout_secs: Some(120),
        }
    }
}

/// Decides when a turn stores a full snapshot instead of a diff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotPolicy {
    /// Snapshot once the diff is larger than this fraction of the full state.
    pub max_diff_ratio: f64,
    /// States smaller than this are always stored as diffs.
    pub min_snapshot_bytes: usize,
    /// Force a checkpoint after this many consecutive diff turns on a path.
    pub checkpoint_interval: usize,
    /// Text markers that mark a turn as resetting the variable state.
    pub init_markers: Vec<String>,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            max_diff_ratio: 0.5,
            min_snapshot_bytes: 512,
            checkpoint_interval: 16,
            init_markers: vec!["<initvar>".to_string()],
        }
    }
}

impl SnapshotPolicy {
    pub fn signals_initialization(&self, text: &str) -> bool {
        self.init_markers
            .iter()
            .any(|marker| !marker.is_empty() && text.contains(marker.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineSettings {
    /// Number of ancestor turns rendered into the prompt.
    pub max_history_turns: usize,
    /// Maximum knowledge entries injected per turn.
    pub knowledge_limit: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_history_turns: 20,
            knowledge_limit: 4,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtensionSettings {
    /// Append an inline annotation to the response when a hook or tool fails.
    #[serde(default)]
    pub annotate_errors: bool,
}

const CONFIG_FILE_PATH: &str = "config.toml";

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            snapshot_policy: SnapshotPolicy::default(),
            pipeline: PipelineSettings::default(),
            extensions: ExtensionSettings::default(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load from ~/.branchtale/config.json, then ./config.toml, then apply
    /// environment overrides. Unreadable files fall back to defaults.
    pub fn load() -> Self {
        let mut config = None;

        let json_path = config_json_path();
        if json_path.exists() {
            match Self::from_path(&json_path) {
                Ok(file_config) => config = Some(file_config),
                Err(error) => log::warn!("Ignoring {}: {error:#}", json_path.display()),
            }
        }

        if config.is_none() && Path::new(CONFIG_FILE_PATH).exists() {
            match Self::from_path(Path::new(CONFIG_FILE_PATH)) {
                Ok(file_config) => config = Some(file_config),
                Err(error) => log::warn!("Ignoring {CONFIG_FILE_PATH}: {error:#}"),
            }
        }

        let mut config = config.unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    /// Parse a config file; `.toml` files are read as TOML, everything else as JSON.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        if is_toml {
            toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))
        } else {
            serde_json::from_str(&content)
                .with_context(|| format!("invalid JSON in {}", path.display()))
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(api_key) = std::env::var("API_KEY") {
            self.model.api_key = Some(api_key);
        }
        if let Ok(api_base) = std::env::var("API_BASE") {
            self.model.api_base = api_base;
        }
        if let Ok(model) = std::env::var("MODEL") {
            self.model.model = model;
        }
        if let Ok(stream) = std::env::var("BRANCHTALE_STREAM") {
            self.model.stream = parse_bool_env(&stream);
        }
        if let Ok(data_dir) = std::env::var("BRANCHTALE_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }
    }
}
