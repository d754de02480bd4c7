//! # Configuration Management
//!
//! Handles all configuration for Cairn nodes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub log: TransactionLogConfig,
    pub locks: LockConfig,
    pub session: SessionConfig,
    pub housekeeping: HousekeepingConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a JSON document. Missing sections fall back to defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json).map_err(|e| Error::Configuration {
            message: format!("invalid configuration: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("cannot read {:?}: {}", path, e),
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.storage.compaction_dirty_ratio) {
            return Err(Error::Configuration {
                message: "storage.compaction_dirty_ratio must be within [0, 1]".to_string(),
            });
        }
        if self.housekeeping.queue_capacity == 0 {
            return Err(Error::Configuration {
                message: "housekeeping.queue_capacity must be positive".to_string(),
            });
        }
        if self.session.max_chunk_items == 0 {
            return Err(Error::Configuration {
                message: "session.max_chunk_items must be positive".to_string(),
            });
        }
        // a coordinator must give up on a participant before that
        // participant gives up waiting for the decision
        let continue_timeout = self.session.continue_timeout;
        if self.session.response_timeout >= continue_timeout {
            return Err(Error::Configuration {
                message: format!(
                    "session.response_timeout ({:?}) must be below session.continue_timeout ({:?})",
                    self.session.response_timeout, continue_timeout
                ),
            });
        }
        if self.locks.acquire_timeout >= continue_timeout {
            return Err(Error::Configuration {
                message: format!(
                    "locks.acquire_timeout ({:?}) must be below session.continue_timeout ({:?})",
                    self.locks.acquire_timeout, continue_timeout
                ),
            });
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub storage_file: String,
    pub temp_file: String,
    pub sync_writes: bool,
    pub buffer_size: usize,
    /// Dead-byte fraction above which housekeeping compacts.
    pub compaction_dirty_ratio: f64,
    /// Files smaller than this are never compacted automatically.
    pub min_compaction_bytes: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            storage_file: "objects.cairn".to_string(),
            temp_file: "objects.cairn.tmp".to_string(),
            sync_writes: true,
            buffer_size: 64 * 1024, // 64KB
            compaction_dirty_ratio: 0.5,
            min_compaction_bytes: 4 * 1024 * 1024, // 4MB
        }
    }
}

/// Transaction log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionLogConfig {
    pub file_name: String,
    /// Rotation threshold in bytes.
    pub max_size: u64,
    pub sync_on_write: bool,
}

impl Default for TransactionLogConfig {
    fn default() -> Self {
        Self {
            file_name: "transactions.log".to_string(),
            max_size: 64 * 1024 * 1024, // 64MB
            sync_on_write: true,
        }
    }
}

/// Lock manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(with = "duration_ms")]
    pub acquire_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Session and handshake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a node waits for `Continue` before aborting. Must exceed
    /// both `response_timeout` and `locks.acquire_timeout`.
    #[serde(with = "duration_ms")]
    pub continue_timeout: Duration,
    /// How long a coordinator waits for each participant's answer.
    #[serde(with = "duration_ms")]
    pub response_timeout: Duration,
    /// Objects per `Data` chunk when streaming a read.
    pub max_chunk_items: usize,
    /// Capacity of the per-session request queue.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            continue_timeout: Duration::from_secs(15),
            response_timeout: Duration::from_secs(10),
            max_chunk_items: 256,
            queue_capacity: 64,
        }
    }
}

/// Background worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    #[serde(with = "duration_ms")]
    pub interval: Duration,
    pub queue_capacity: usize,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            queue_capacity: 16,
        }
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    pub max_frame_size: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4848".to_string(),
            max_frame_size: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
        }
    }
}

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Log formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    Text,
    Json,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(
            r#"{ "locks": { "acquire_timeout": 250 }, "storage": { "sync_writes": false } }"#,
        )
        .unwrap();
        assert_eq!(config.locks.acquire_timeout, Duration::from_millis(250));
        assert!(!config.storage.sync_writes);
        assert_eq!(config.storage.storage_file, "objects.cairn");
        assert_eq!(config.session.max_chunk_items, 256);
    }

    #[test]
    fn test_rejects_bad_ratio() {
        let err = Config::from_json_str(r#"{ "storage": { "compaction_dirty_ratio": 1.5 } }"#);
        assert!(matches!(err, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_decision_wait_shorter_than_response_wait() {
        let err = Config::from_json_str(
            r#"{ "session": { "continue_timeout": 300, "response_timeout": 400 } }"#,
        );
        assert!(matches!(err, Err(Error::Configuration { .. })));

        let err = Config::from_json_str(
            r#"{ "session": { "continue_timeout": 300, "response_timeout": 300 } }"#,
        );
        assert!(matches!(err, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_rejects_lock_wait_longer_than_decision_wait() {
        let err = Config::from_json_str(
            r#"{ "locks": { "acquire_timeout": 500 },
                 "session": { "continue_timeout": 300, "response_timeout": 200 } }"#,
        );
        assert!(matches!(err, Err(Error::Configuration { .. })));

        let config = Config::from_json_str(
            r#"{ "locks": { "acquire_timeout": 100 },
                 "session": { "continue_timeout": 300, "response_timeout": 200 } }"#,
        )
        .unwrap();
        assert_eq!(config.session.continue_timeout, Duration::from_millis(300));
    }
}
