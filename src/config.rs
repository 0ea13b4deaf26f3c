//! Engine configuration
//!
//! Handles loading and managing configuration from hfsvol.json

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use crate::hfs::FormatOptions;

/// Name of the configuration file looked up next to the working directory
/// and the executable
pub const CONFIG_FILE_NAME: &str = "hfsvol.json";

/// Global engine config
static ENGINE_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Get the global engine config
pub fn get_config() -> &'static EngineConfig {
    ENGINE_CONFIG.get_or_init(EngineConfig::load)
}

/// Root engine configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    /// Compare catalog names byte for byte instead of folding case
    #[serde(default)]
    pub case_sensitive: bool,
    /// Clean B-tree nodes kept in memory per tree
    #[serde(default = "default_node_cache_capacity")]
    pub node_cache_capacity: usize,
    #[serde(default)]
    pub format: FormatConfig,
}

fn default_node_cache_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            node_cache_capacity: default_node_cache_capacity(),
            format: FormatConfig::default(),
        }
    }
}

/// Settings used when formatting a new volume
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FormatConfig {
    #[serde(default = "default_volume_name")]
    pub volume_name: String,
    /// Image size in bytes when a new image file has to be created
    #[serde(default = "default_size")]
    pub default_size: u64,
    /// Allocation block size; chosen from the image size when absent
    #[serde(default)]
    pub allocation_block_size: Option<u32>,
}

fn default_volume_name() -> String {
    "Untitled".to_string()
}

fn default_size() -> u64 {
    10 * 1024 * 1024
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            volume_name: default_volume_name(),
            default_size: default_size(),
            allocation_block_size: None,
        }
    }
}

impl FormatConfig {
    pub fn options(&self) -> FormatOptions {
        FormatOptions {
            volume_name: self.volume_name.clone(),
            block_size: self.allocation_block_size,
        }
    }
}

impl EngineConfig {
    /// Load configuration from hfsvol.json
    pub fn load() -> Self {
        // Try to load from current directory first
        if let Ok(config) = Self::load_from_path(CONFIG_FILE_NAME) {
            log::info!("Loaded config from ./{}", CONFIG_FILE_NAME);
            return config;
        }

        // Try to load from executable directory
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                let config_path = exe_dir.join(CONFIG_FILE_NAME);
                if let Ok(config) = Self::load_from_path(&config_path) {
                    log::info!("Loaded config from {}", config_path.display());
                    return config;
                }
            }
        }

        log::info!("No {} found, using defaults", CONFIG_FILE_NAME);
        Self::default()
    }

    pub fn load_from_path(path: impl Into<PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.into();
        let content = fs::read_to_string(&path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: EngineConfig = serde_json::from_str(r#"{"case_sensitive": true}"#).unwrap();
        assert!(config.case_sensitive);
        assert_eq!(config.node_cache_capacity, 256);
        assert_eq!(config.format.volume_name, "Untitled");
        assert_eq!(config.format.default_size, 10 * 1024 * 1024);
        assert!(config.format.allocation_block_size.is_none());
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"format": {{"volume_name": "Scratch", "allocation_block_size": 1024}}}}"#
        )
        .unwrap();

        let config = EngineConfig::load_from_path(file.path()).unwrap();
        let options = config.format.options();
        assert_eq!(options.volume_name, "Scratch");
        assert_eq!(options.block_size, Some(1024));
        assert!(!config.case_sensitive);
    }

    #[test]
    fn test_load_from_missing_path_fails() {
        assert!(EngineConfig::load_from_path("/nonexistent/hfsvol.json").is_err());
    }
}
