use std::path::PathBuf;

/// Application directory (~/.branchtale)
pub fn app_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
        .join(".branchtale")
}

/// Path of config.json inside the application directory
pub fn config_json_path() -> PathBuf {
    app_dir().join("config.json")
}

/// Default directory for persisted conversation collections
pub fn default_data_dir() -> PathBuf {
    app_dir().join("data")
}
