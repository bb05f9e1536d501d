//! Engine configuration.
//!
//! Compiled defaults, overridable from a TOML `[engine]` section with
//! partial overrides (every file field is optional). The embedding
//! application decides where the file lives and passes the path or the
//! raw contents in.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryOptions;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    engine: EngineFileConfig,
}

/// `[engine]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct EngineFileConfig {
    history_window: Option<usize>,
    transmit_initial_wait_ms: Option<u64>,
    transmit_max_wait_ms: Option<u64>,
    transmit_max_attempts: Option<u32>,
    transmit_attempt_timeout_ms: Option<u64>,
    sync_initial_wait_ms: Option<u64>,
    sync_max_wait_ms: Option<u64>,
    sync_max_attempts: Option<u32>,
    sync_attempt_timeout_ms: Option<u64>,
}

/// Resolved engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How many of the newest stored messages are loaded into the
    /// in-memory window at startup.
    pub history_window: usize,
    /// Retry policy for message delivery. Unlimited attempts by
    /// default; manual-send escalation is the user-visible bound.
    pub transmit: RetryOptions,
    /// Retry policy for history synchronization and older-history
    /// fetches. Bounded: a failed sync surfaces to the caller.
    pub sync: RetryOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_window: 32,
            transmit: RetryOptions::default(),
            sync: RetryOptions::bounded(6),
        }
    }
}

impl EngineConfig {
    /// Parses configuration from TOML text, applying overrides on top
    /// of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseToml`] on malformed TOML.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(text)?;
        let mut config = Self::default();
        config.apply(&file.engine);
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ReadFile`] if the file cannot be read, or
    /// [`ConfigError::ParseToml`] on malformed TOML.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    fn apply(&mut self, file: &EngineFileConfig) {
        if let Some(window) = file.history_window {
            self.history_window = window;
        }
        if let Some(ms) = file.transmit_initial_wait_ms {
            self.transmit.initial_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = file.transmit_max_wait_ms {
            self.transmit.max_single_wait = Duration::from_millis(ms);
        }
        if let Some(n) = file.transmit_max_attempts {
            self.transmit.max_attempts = n;
        }
        if let Some(ms) = file.transmit_attempt_timeout_ms {
            self.transmit.attempt_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = file.sync_initial_wait_ms {
            self.sync.initial_wait = Duration::from_millis(ms);
        }
        if let Some(ms) = file.sync_max_wait_ms {
            self.sync.max_single_wait = Duration::from_millis(ms);
        }
        if let Some(n) = file.sync_max_attempts {
            self.sync.max_attempts = n;
        }
        if let Some(ms) = file.sync_attempt_timeout_ms {
            self.sync.attempt_timeout = Some(Duration::from_millis(ms));
        }
    }
}
