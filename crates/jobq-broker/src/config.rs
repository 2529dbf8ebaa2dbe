use jobq_core::{EngineConfig, WEATHER_HANDLER};
use jobq_worker::{WeatherConfig, WorkerConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker: NetworkConfig,
    pub persistence: PersistenceConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
    pub engine: EngineConfig,
    pub workers: EmbeddedWorkersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host: String,
    pub port: u16,
    /// Upper bound on how long a remote claim may be held open
    pub max_claim_wait_ms: u64,
    /// Interval of the lease reaping / record purging sweep
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub rest_port: u16,
    /// Handler names accepted on submission
    pub handlers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub prometheus_port: u16,
    pub log_level: String,
    /// `text` or `json`
    pub log_format: String,
}

/// Workers running inside the broker process against its own backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedWorkersConfig {
    /// Zero disables embedded workers
    pub count: usize,
    pub handler_timeout_ms: Option<u64>,
    pub graceful_shutdown_timeout_secs: u64,
    pub weather: WeatherConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            host: "0.0.0.0".to_string(),
            port: 6380,
            max_claim_wait_ms: 30_000,
            sweep_interval_ms: 1_000,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        PersistenceConfig {
            backend: StorageBackend::Rocksdb,
            data_dir: PathBuf::from("./data"),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            rest_port: 8080,
            handlers: vec![WEATHER_HANDLER.to_string()],
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            prometheus_port: 9091,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
        }
    }
}

impl Default for EmbeddedWorkersConfig {
    fn default() -> Self {
        EmbeddedWorkersConfig {
            count: 0,
            handler_timeout_ms: None,
            graceful_shutdown_timeout_secs: 60,
            weather: WeatherConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BrokerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn max_claim_wait(&self) -> Duration {
        Duration::from_millis(self.broker.max_claim_wait_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.broker.sweep_interval_ms.max(1))
    }

    /// Settings for the embedded worker pool
    pub fn to_worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_id: Some(format!("broker-{}", std::process::id())),
            concurrency: self.workers.count,
            graceful_shutdown_timeout_secs: self.workers.graceful_shutdown_timeout_secs,
            handler_timeout_ms: self.workers.handler_timeout_ms,
            log_level: self.monitoring.log_level.clone(),
            log_format: self.monitoring.log_format.clone(),
            engine: self.engine.clone(),
            weather: self.workers.weather.clone(),
            ..WorkerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
broker:
  port: 7000
persistence:
  backend: memory
engine:
  result_ttl_secs: 60
workers:
  count: 2
"#
        )
        .unwrap();

        let config = BrokerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.broker.port, 7000);
        assert_eq!(config.broker.host, "0.0.0.0");
        assert_eq!(config.persistence.backend, StorageBackend::Memory);
        assert_eq!(config.engine.result_ttl_secs, 60);
        assert_eq!(config.engine.max_attempts, 3);
        assert_eq!(config.api.handlers, vec!["weather".to_string()]);

        let workers = config.to_worker_config();
        assert_eq!(workers.concurrency, 2);
        assert_eq!(workers.engine.result_ttl_secs, 60);
    }
}
