use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration for the stagehand backend.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Address the listener-event intake binds to. Default: "0.0.0.0:8123".
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Backing store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Engine behavior knobs.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: default_listen(),
            store: StoreConfig::default(),
            engine: EngineConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Which backend persists entity documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Mongo,
    Memory,
}

/// Backing store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend kind. Default: mongo.
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// Connection string. Default: "mongodb://localhost:27017".
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Database name. Default: "stagehand".
    #[serde(default = "default_store_database")]
    pub database: String,

    /// Connect/server-selection timeout. Default: 10s.
    #[serde(default = "default_store_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: default_store_url(),
            database: default_store_database(),
            connect_timeout: default_store_timeout(),
        }
    }
}

/// How task and task-attempt records are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskRecordMode {
    /// Own documents in the tasks/task_attempts collections (rate-limited).
    #[default]
    Own,
    /// Sub-records bound into their stage/stage-attempt documents.
    Subrecord,
}

/// Engine behavior knobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Task/task-attempt record placement. Default: own.
    #[serde(default)]
    pub task_records: TaskRecordMode,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Enable the health server. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Bind address. Default: "127.0.0.1:9091".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8123".to_string()
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Mongo
}

fn default_store_url() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_store_database() -> String {
    "stagehand".to_string()
}

fn default_store_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_health_addr() -> String {
    "127.0.0.1:9091".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg: Config = serde_yaml::from_str("{}").expect("empty config parses");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.listen, "0.0.0.0:8123");
        assert_eq!(cfg.store.backend, StoreBackend::Mongo);
        assert_eq!(cfg.store.database, "stagehand");
        assert_eq!(cfg.engine.task_records, TaskRecordMode::Own);
        assert!(!cfg.health.enabled);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
log_level: debug
listen: "127.0.0.1:9000"
store:
  backend: memory
  database: spark_history
  connect_timeout: 2s
engine:
  task_records: subrecord
health:
  enabled: true
  addr: "0.0.0.0:9100"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("config parses");
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.store.connect_timeout, Duration::from_secs(2));
        assert_eq!(cfg.engine.task_records, TaskRecordMode::Subrecord);
        assert!(cfg.health.enabled);
    }
}
