//! JSON configuration loading.
//!
//! Configuration structs live next to the code they configure and derive
//! `serde::Deserialize`; this module only provides the file plumbing and the
//! window section shared by every front end.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Window creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct WindowConfig {
    /// Title shown by the platform.
    pub title: String,
    /// Initial drawable width in pixels.
    pub width: u32,
    /// Initial drawable height in pixels.
    pub height: u32,
    /// Whether the user may resize the window.
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "vkframe".to_string(),
            width: 1280,
            height: 720,
            resizable: true,
        }
    }
}

impl WindowConfig {
    /// Rejects zero-sized windows.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::Config(format!(
                "window size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

/// Parses a configuration value from a JSON string.
pub fn from_json_str<T: DeserializeOwned>(contents: &str) -> Result<T> {
    Ok(serde_json::from_str(contents)?)
}

/// Reads and parses a JSON configuration file.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read and [`Error::Config`] if
/// it is not valid JSON for `T`.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path)?;
    let value = from_json_str(&contents)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
    info!("Loaded config from {:?}", path);
    Ok(value)
}

/// Like [`load_json`], but a missing file yields `T::default()`.
///
/// A file that exists but fails to parse is still an error.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        warn!("No config file found at {:?}, using defaults", path);
        return Ok(T::default());
    }
    load_json(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_config_defaults_fill_missing_fields() {
        let config: WindowConfig = from_json_str(r#"{ "width": 640 }"#).unwrap();
        assert_eq!(config.width, 640);
        assert_eq!(config.height, 720);
        assert_eq!(config.title, "vkframe");
        assert!(config.resizable);
    }

    #[test]
    fn test_window_config_rejects_zero_size() {
        let config = WindowConfig {
            height: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let result: Result<WindowConfig> = from_json_str("{ width: }");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let path = std::env::temp_dir().join("vkframe-missing-config-7f3a.json");
        let config: WindowConfig = load_json_or_default(&path).unwrap();
        assert_eq!(config, WindowConfig::default());
    }

    #[test]
    fn test_load_json_reads_file() {
        let path = std::env::temp_dir().join(format!("vkframe-config-{}.json", std::process::id()));
        fs::write(&path, r#"{ "title": "demo", "width": 320, "height": 200 }"#).unwrap();
        let config: WindowConfig = load_json(&path).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(config.title, "demo");
        assert_eq!((config.width, config.height), (320, 200));
    }
}
