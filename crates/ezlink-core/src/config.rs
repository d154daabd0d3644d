//! Configuration system for ezlink.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $EZLINK_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ezlink/config.toml
//!   3. ~/.config/ezlink/config.toml

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::wire::{CHUNK_SIZE, MESSAGE_LIMIT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EzlinkConfig {
    pub link: LinkConfig,
    pub upload: UploadConfig,
    pub router: RouterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Largest single message the radio accepts, in bytes.
    pub message_limit: usize,
    /// Pause between queued commands on the link.
    pub command_settle_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Raw bytes per chunk. Must be a multiple of 3.
    pub chunk_size: usize,
    /// Ack wait after the first send of a chunk.
    pub ack_timeout_ms: u64,
    /// Ack wait after each retransmission.
    pub retry_ack_timeout_ms: u64,
    pub max_retries: u32,
    /// Backoff before retransmission N is `N * retry_base_delay_ms`.
    pub retry_base_delay_ms: u64,
    pub inter_chunk_delay_ms: u64,
    pub file_start_delay_ms: u64,
    pub file_end_delay_ms: u64,
    pub inter_file_delay_ms: u64,
    /// Lets the link's message handler settle before the first command.
    pub handler_settle_ms: u64,
    pub upload_mode_settle_ms: u64,
    pub commit_settle_ms: u64,
    pub abort_settle_ms: u64,
    pub rollback_settle_ms: u64,
    pub backup_settle_ms: u64,
    pub apply_settle_ms: u64,
    pub cleanup_settle_ms: u64,
    /// Files needing more frames than this are logged as risky. 0 = off.
    pub chunk_warning_threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Identical messages inside this window are dropped.
    pub dedup_window_ms: u64,
    /// Remembered messages older than this are evicted.
    pub dedup_retention_ms: u64,
    /// Hard cap on remembered messages.
    pub dedup_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing-subscriber filter directive. `RUST_LOG` wins when set.
    pub filter: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            message_limit: MESSAGE_LIMIT,
            command_settle_ms: 10,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            ack_timeout_ms: 5000,
            retry_ack_timeout_ms: 2000,
            max_retries: 7,
            retry_base_delay_ms: 200,
            inter_chunk_delay_ms: 100,
            file_start_delay_ms: 100,
            file_end_delay_ms: 500,
            inter_file_delay_ms: 100,
            handler_settle_ms: 300,
            upload_mode_settle_ms: 500,
            commit_settle_ms: 1000,
            abort_settle_ms: 200,
            rollback_settle_ms: 2000,
            backup_settle_ms: 500,
            apply_settle_ms: 500,
            cleanup_settle_ms: 1000,
            chunk_warning_threshold: 20,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: 100,
            dedup_retention_ms: 5000,
            dedup_capacity: 256,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

impl LinkConfig {
    pub fn command_settle(&self) -> Duration {
        ms(self.command_settle_ms)
    }
}

impl UploadConfig {
    pub fn ack_timeout(&self) -> Duration {
        ms(self.ack_timeout_ms)
    }
    pub fn retry_ack_timeout(&self) -> Duration {
        ms(self.retry_ack_timeout_ms)
    }
    pub fn retry_base_delay(&self) -> Duration {
        ms(self.retry_base_delay_ms)
    }
    pub fn inter_chunk_delay(&self) -> Duration {
        ms(self.inter_chunk_delay_ms)
    }
    pub fn file_start_delay(&self) -> Duration {
        ms(self.file_start_delay_ms)
    }
    pub fn file_end_delay(&self) -> Duration {
        ms(self.file_end_delay_ms)
    }
    pub fn inter_file_delay(&self) -> Duration {
        ms(self.inter_file_delay_ms)
    }
    pub fn handler_settle(&self) -> Duration {
        ms(self.handler_settle_ms)
    }
    pub fn upload_mode_settle(&self) -> Duration {
        ms(self.upload_mode_settle_ms)
    }
    pub fn commit_settle(&self) -> Duration {
        ms(self.commit_settle_ms)
    }
    pub fn abort_settle(&self) -> Duration {
        ms(self.abort_settle_ms)
    }
    pub fn rollback_settle(&self) -> Duration {
        ms(self.rollback_settle_ms)
    }
    pub fn backup_settle(&self) -> Duration {
        ms(self.backup_settle_ms)
    }
    pub fn apply_settle(&self) -> Duration {
        ms(self.apply_settle_ms)
    }
    pub fn cleanup_settle(&self) -> Duration {
        ms(self.cleanup_settle_ms)
    }
}

impl RouterConfig {
    pub fn dedup_window(&self) -> Duration {
        ms(self.dedup_window_ms)
    }
    pub fn dedup_retention(&self) -> Duration {
        ms(self.dedup_retention_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("ezlink")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EzlinkConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// [`load`](Self::load) with an explicit file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            Self::from_toml(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            EzlinkConfig::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that work against each other.
    ///
    /// A retransmitted frame draws the same ack text as its first attempt.
    /// If the first backoff is shorter than the dedup window, that ack is
    /// dropped as a repeat and the retry waits out its full timeout.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.retry_base_delay_ms < self.router.dedup_window_ms {
            return Err(ConfigError::Invalid(format!(
                "upload.retry_base_delay_ms ({}) must be at least router.dedup_window_ms ({})",
                self.upload.retry_base_delay_ms, self.router.dedup_window_ms
            )));
        }
        Ok(())
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("EZLINK_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = EzlinkConfig::default().to_toml()?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            tracing::info!(path = %path.display(), "wrote default config");
        }
        Ok(path)
    }

    /// Apply EZLINK_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(key: &str, v: String) -> Option<T> {
            let parsed = v.parse().ok();
            if parsed.is_none() {
                tracing::warn!(key, value = %v, "ignoring unparseable override");
            }
            parsed
        }

        if let Some(v) = var("EZLINK_UPLOAD__CHUNK_SIZE").and_then(|v| parsed("EZLINK_UPLOAD__CHUNK_SIZE", v)) {
            self.upload.chunk_size = v;
        }
        if let Some(v) = var("EZLINK_UPLOAD__MAX_RETRIES").and_then(|v| parsed("EZLINK_UPLOAD__MAX_RETRIES", v)) {
            self.upload.max_retries = v;
        }
        if let Some(v) = var("EZLINK_UPLOAD__ACK_TIMEOUT_MS").and_then(|v| parsed("EZLINK_UPLOAD__ACK_TIMEOUT_MS", v)) {
            self.upload.ack_timeout_ms = v;
        }
        if let Some(v) = var("EZLINK_LINK__MESSAGE_LIMIT").and_then(|v| parsed("EZLINK_LINK__MESSAGE_LIMIT", v)) {
            self.link.message_limit = v;
        }
        if let Some(v) = var("EZLINK_LOG") {
            self.logging.filter = v;
        }
    }
}
