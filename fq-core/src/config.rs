//! # Configuration Management
//!
//! YAML configuration (`config.yml`) with per-section defaults and startup
//! validation. Durations are written as `10ms`/`1s`/`5m` strings and sizes
//! as `4KB`/`10MB`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::utils::{parse_duration, parse_size};

pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub wal: Option<WalConfig>,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_type", rename = "type")]
    pub engine_type: String,
    #[serde(
        default = "default_clean_interval",
        deserialize_with = "de_duration"
    )]
    pub clean_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalConfig {
    #[serde(default = "default_flushing_batch_length")]
    pub flushing_batch_length: usize,
    #[serde(
        default = "default_flushing_batch_timeout",
        deserialize_with = "de_duration"
    )]
    pub flushing_batch_timeout: Duration,
    #[serde(default = "default_max_segment_size", deserialize_with = "de_size")]
    pub max_segment_size: usize,
    #[serde(default = "default_wal_directory")]
    pub data_directory: PathBuf,
    #[serde(default)]
    pub sync_commit: SyncCommit,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_message_size", deserialize_with = "de_size")]
    pub max_message_size: usize,
    #[serde(default = "default_idle_timeout", deserialize_with = "de_duration")]
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DumpConfig {
    #[serde(default = "default_dump_interval", deserialize_with = "de_duration")]
    pub interval: Duration,
    #[serde(default = "default_dump_directory")]
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub replica_type: ReplicaType,
    #[serde(default = "default_master_address")]
    pub master_address: String,
    #[serde(default = "default_sync_interval", deserialize_with = "de_duration")]
    pub sync_interval: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncCommit {
    #[default]
    On,
    Off,
}

impl SyncCommit {
    pub fn is_on(self) -> bool {
        self == SyncCommit::On
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicaType {
    #[default]
    Master,
    Slave,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let meta = std::fs::metadata(path).map_err(|e| Error::Configuration {
            message: format!("stat config {path:?}: {e}"),
        })?;
        if meta.is_dir() {
            return Err(Error::Configuration {
                message: format!("config {path:?} is a directory"),
            });
        }

        let data = std::fs::read_to_string(path).map_err(|e| Error::Configuration {
            message: format!("read config {path:?}: {e}"),
        })?;

        let cfg: Config = serde_yaml::from_str(&data).map_err(|e| Error::Configuration {
            message: format!("parse config: {e}"),
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.engine_type != "in_memory" {
            return Err(Error::Configuration {
                message: format!("unsupported engine type {:?}", self.engine.engine_type),
            });
        }
        if self.engine.clean_interval.is_zero() {
            return Err(Error::Configuration {
                message: "engine.clean_interval must be positive".to_string(),
            });
        }

        if let Some(wal) = &self.wal {
            if wal.flushing_batch_length == 0 {
                return Err(Error::Configuration {
                    message: "wal.flushing_batch_length must be positive".to_string(),
                });
            }
            if wal.max_segment_size == 0 {
                return Err(Error::Configuration {
                    message: "wal.max_segment_size must be positive".to_string(),
                });
            }
        }

        if self.network.address.is_empty() {
            return Err(Error::Configuration {
                message: "network.address is required".to_string(),
            });
        }
        if self.network.max_connections == 0 {
            return Err(Error::Configuration {
                message: "network.max_connections must be positive".to_string(),
            });
        }
        if self.network.max_message_size == 0 {
            return Err(Error::Configuration {
                message: "network.max_message_size must be positive".to_string(),
            });
        }

        if self.dump.interval.is_zero() {
            return Err(Error::Configuration {
                message: "dump.interval must be positive".to_string(),
            });
        }
        if self.dump.directory.as_os_str().is_empty() {
            return Err(Error::Configuration {
                message: "dump.directory is required".to_string(),
            });
        }

        if self.replication.replica_type == ReplicaType::Slave
            && self.replication.master_address.is_empty()
        {
            return Err(Error::Configuration {
                message: "replication.master_address is required for a slave".to_string(),
            });
        }

        match self.logging.level.as_str() {
            "debug" | "info" | "warn" | "error" => Ok(()),
            other => Err(Error::Configuration {
                message: format!("unknown logging level {other:?}"),
            }),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            wal: Some(WalConfig::default()),
            network: NetworkConfig::default(),
            dump: DumpConfig::default(),
            replication: ReplicationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_type: default_engine_type(),
            clean_interval: default_clean_interval(),
        }
    }
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            flushing_batch_length: default_flushing_batch_length(),
            flushing_batch_timeout: default_flushing_batch_timeout(),
            max_segment_size: default_max_segment_size(),
            data_directory: default_wal_directory(),
            sync_commit: SyncCommit::On,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            interval: default_dump_interval(),
            directory: default_dump_directory(),
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replica_type: ReplicaType::Master,
            master_address: default_master_address(),
            sync_interval: default_sync_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_engine_type() -> String {
    "in_memory".to_string()
}

fn default_clean_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_flushing_batch_length() -> usize {
    100
}

fn default_flushing_batch_timeout() -> Duration {
    Duration::from_millis(10)
}

fn default_max_segment_size() -> usize {
    10 << 20
}

fn default_wal_directory() -> PathBuf {
    PathBuf::from("./data/fq/wal")
}

fn default_address() -> String {
    "127.0.0.1:1945".to_string()
}

fn default_max_connections() -> usize {
    100
}

fn default_max_message_size() -> usize {
    4 << 10
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_dump_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_dump_directory() -> PathBuf {
    PathBuf::from("./data/fq/dump")
}

fn default_master_address() -> String {
    "127.0.0.1:1946".to_string()
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn de_duration<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn de_size<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<usize, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_size(&raw).map_err(serde::de::Error::custom)
}
