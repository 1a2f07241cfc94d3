//! Configuration file structures for wasm-embed.
//!
//! A run can be described by a TOML file instead of (or in addition to)
//! command-line flags. Flags given on the command line win.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{AotConfig, RunConfig, VmConfig};

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [vm]
/// default_memory_pages = 128
/// default_table_size = 65536
/// disable_floating_point = false
/// gas_limit = 10_000_000
///
/// [aot]
/// enabled = true
/// cache_dir = "./cache"
///
/// [run]
/// entry = "app_main"
/// args = [1, 2]
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Virtual machine settings.
    #[serde(default)]
    pub vm: VmConfig,

    /// AOT acceleration settings.
    #[serde(default)]
    pub aot: AotConfig,

    /// Entry function and arguments.
    #[serde(default)]
    pub run: RunConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigFileError::Io {
            path: path.display().to_string(),
            source: e,
        })?;

        debug!(path = %path.display(), "Loading config file");

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.vm, VmConfig::default());
        assert!(!config.aot.enabled);
        assert_eq!(config.run.entry, "app_main");
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [run]
            entry = "main"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.run.entry, "main");
        // Defaults applied
        assert_eq!(config.vm.default_memory_pages, 128);
        assert!(config.run.args.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [vm]
            default_memory_pages = 4
            default_table_size = 32
            disable_floating_point = true
            max_memory_pages = 16
            gas_limit = 5_000_000

            [aot]
            enabled = true
            cache_dir = "./cache"

            [run]
            entry = "fib"
            args = [10, -3]
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.vm.default_memory_pages, 4);
        assert_eq!(config.vm.default_table_size, 32);
        assert!(config.vm.disable_floating_point);
        assert_eq!(config.vm.max_memory_pages, 16);
        assert_eq!(config.vm.gas_limit, 5_000_000);
        assert!(config.aot.enabled);
        assert_eq!(
            config.aot.cache_dir.as_deref(),
            Some(Path::new("./cache"))
        );
        assert_eq!(config.run.entry, "fib");
        assert_eq!(config.run.args, vec![10, -3]);
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(matches!(result, Err(ConfigFileError::Parse { .. })));
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/wasm-embed.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
