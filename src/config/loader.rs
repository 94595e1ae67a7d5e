//! Locating and parsing the relay's TOML configuration.

use std::path::PathBuf;

use super::RelayConfig;

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = ".camera-relay.toml";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Resolves the config file and falls back to defaults when there is none.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    candidates: Vec<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Look in the working directory first, then in the user config
    /// directory (`camera-relay/config.toml`).
    #[must_use]
    pub fn new() -> Self {
        let user = dirs::config_dir().map(|dir| dir.join("camera-relay").join("config.toml"));
        Self {
            candidates: std::iter::once(PathBuf::from(LOCAL_CONFIG_FILE))
                .chain(user)
                .collect(),
        }
    }

    /// Only consult `path`.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            candidates: vec![path],
        }
    }

    /// Parse the first candidate that exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if that file cannot be read or parsed.
    pub fn load(&self) -> Result<RelayConfig, ConfigError> {
        let Some(path) = self.candidates.iter().find(|p| p.is_file()) else {
            tracing::debug!(candidates = ?self.candidates, "No config file, using defaults");
            return Ok(RelayConfig::default());
        };

        tracing::info!(path = %path.display(), "Using config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }
}
