//! Configuration file for ~/.config/gator/config.toml.
//!
//! The file is optional: a missing or empty file yields `Config::default()`.
//! Unknown keys are accepted but logged as a warning, since they are most
//! likely typos. Unlike a read-only settings file, this one is also written
//! back: `login` and `register` store the current user here.
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{FailurePolicy, DEFAULT_FETCH_TIMEOUT, DEFAULT_USER_AGENT};

/// Overrides the config directory (default `~/.config/gator`)
pub const CONFIG_DIR_ENV: &str = "GATOR_CONFIG_DIR";
/// Overrides `database_path`
pub const DATABASE_ENV: &str = "GATOR_DATABASE";

const CONFIG_FILE_NAME: &str = "config.toml";
const DEFAULT_DATABASE_FILE: &str = "gator.db";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Cannot locate config directory: HOME is not set and {CONFIG_DIR_ENV} is empty")]
    NoHome,
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. Relative paths are taken from the config directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,

    /// User selected by `register`/`login`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_user_id: Option<i64>,

    /// Budget for a single feed fetch, in seconds.
    pub fetch_timeout_secs: u64,

    /// `User-Agent` header sent with feed requests.
    pub user_agent: String,

    /// Keep a feed at the front of the queue after a network error or
    /// timeout instead of moving it behind the other feeds.
    pub retry_transient_failures: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            current_user_id: None,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            retry_transient_failures: false,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "database_path",
        "current_user_id",
        "fetch_timeout_secs",
        "user_agent",
        "retry_transient_failures",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File deleted between metadata and read
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Write the configuration to `path` atomically.
    ///
    /// The TOML is written to a sibling temp file, synced, then renamed over
    /// the target, so readers never observe a half-written config.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        use std::time::{SystemTime, UNIX_EPOCH};
        let random_suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

        let write_result = (|| -> std::io::Result<()> {
            let mut temp_file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true) // Fails if the path exists (prevents symlink race)
                .open(&temp_path)?;
            temp_file.write_all(content.as_bytes())?;
            temp_file.sync_all()?;
            drop(temp_file);

            // On Windows, rename fails if destination exists
            #[cfg(windows)]
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            std::fs::rename(&temp_path, path)
        })();

        if let Err(e) = write_result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(ConfigError::Io(e));
        }

        tracing::debug!(path = %path.display(), "Saved configuration");
        Ok(())
    }

    /// Select the current user and persist the change.
    pub fn set_current_user(&mut self, path: &Path, user_id: i64) -> Result<(), ConfigError> {
        self.current_user_id = Some(user_id);
        self.save(path)
    }

    pub fn fetch_timeout(&self) -> Duration {
        if self.fetch_timeout_secs == 0 {
            tracing::warn!("fetch_timeout_secs = 0 is not allowed, using the default");
            return DEFAULT_FETCH_TIMEOUT;
        }
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        if self.retry_transient_failures {
            FailurePolicy::RetryTransient
        } else {
            FailurePolicy::AdvanceAlways
        }
    }

    /// Database location: `env_override`, then `database_path` (relative to
    /// `config_dir`), then `config_dir/gator.db`.
    pub fn resolve_database_path(&self, config_dir: &Path, env_override: Option<String>) -> PathBuf {
        let configured = env_override
            .filter(|p| !p.trim().is_empty())
            .or_else(|| self.database_path.clone());
        match configured {
            Some(p) if p == ":memory:" => PathBuf::from(p),
            Some(p) => {
                let p = PathBuf::from(p);
                if p.is_absolute() {
                    p
                } else {
                    config_dir.join(p)
                }
            }
            None => config_dir.join(DEFAULT_DATABASE_FILE),
        }
    }
}

/// Config directory: `$GATOR_CONFIG_DIR`, else `~/.config/gator`.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV).filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var_os("HOME").ok_or(ConfigError::NoHome)?;
    Ok(PathBuf::from(home).join(".config").join("gator"))
}

pub fn config_file(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

// ============================================================================
// Tests
// ============================================================================
