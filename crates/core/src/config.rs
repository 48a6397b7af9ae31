//! Engine configuration schema and loader
//!
//! Configuration is an optional TOML file. Every field has a default, so an
//! empty file (or no file at all) yields the stock client and server setup:
//!
//! ```toml
//! [server]
//! port = 8080
//! max_connections = 64
//! no_delay = true
//!
//! [client]
//! host = "localhost"
//! port = 8080
//! connect_timeout_ms = 5000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::{DEFAULT_HOSTNAME, DEFAULT_PORT};

/// File name looked up in the platform config directory
const CONFIG_FILE_NAME: &str = "framelink.toml";

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Admission cap; absent means unlimited
    pub max_connections: Option<usize>,
    pub no_delay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: None,
            no_delay: true,
        }
    }
}

/// Outbound connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub no_delay: bool,
    /// Connect timeout in milliseconds; absent means wait forever
    pub connect_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOSTNAME.to_string(),
            port: DEFAULT_PORT,
            no_delay: true,
            connect_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }
}

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Could not determine config directory")]
    NoConfigDir,
}

impl Config {
    /// Parse configuration from TOML content
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from an explicit path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Platform config file location (e.g. `~/.config/framelink/framelink.toml`)
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("dev", "onyx", "framelink").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load from `path`, or from the default location, falling back to defaults
    /// when the file does not exist
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => return Self::load(p),
            None => match Self::default_path() {
                Ok(p) => p,
                Err(e) => {
                    tracing::debug!(error = %e, "No config directory, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        match Self::load(&path) {
            Err(ConfigError::NotFound(_)) => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.client.host, "localhost");
        assert_eq!(config.client.port, DEFAULT_PORT);
        assert!(config.client.no_delay);
        assert!(config.client.connect_timeout().is_none());
        assert!(config.server.max_connections.is_none());
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[server]
port = 9000
max_connections = 2

[client]
connect_timeout_ms = 250
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_connections, Some(2));
        assert!(config.server.no_delay);
        assert_eq!(config.client.port, DEFAULT_PORT);
        assert_eq!(
            config.client.connect_timeout(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = Config::from_toml("[server]\nport = \"not a number\"");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "[client]\nhost = \"10.1.2.3\"\nno_delay = false\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.client.host, "10.1.2.3");
        assert!(!config.client.no_delay);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing.toml");

        let result = Config::load_or_default(Some(&path));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
