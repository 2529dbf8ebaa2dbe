use crate::weather::WeatherConfig;
use jobq_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub broker_address: String,
    pub worker_id: Option<String>,
    pub concurrency: usize,
    pub graceful_shutdown_timeout_secs: u64,
    /// Off when unset; a timed-out run counts as a recoverable failure
    pub handler_timeout_ms: Option<u64>,
    /// Pause after a queue or store error before claiming again
    pub claim_error_backoff_ms: u64,
    pub log_level: String,
    /// `text` or `json`
    pub log_format: String,
    pub engine: EngineConfig,
    pub weather: WeatherConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            broker_address: "127.0.0.1:6380".to_string(),
            worker_id: None,
            concurrency: 4,
            graceful_shutdown_timeout_secs: 60,
            handler_timeout_ms: None,
            claim_error_backoff_ms: 1_000,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            engine: EngineConfig::default(),
            weather: WeatherConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: WorkerConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn generate_worker_id(&self) -> String {
        if let Some(id) = &self.worker_id {
            return id.clone();
        }

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        let pid = std::process::id();
        let random = Uuid::new_v4().simple().to_string();

        format!("{}-{}-{}", hostname, pid, &random[..8])
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    pub fn claim_error_backoff(&self) -> Duration {
        Duration::from_millis(self.claim_error_backoff_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker_address: \"10.0.0.5:6380\"\nconcurrency: 8\nhandler_timeout_ms: 2500\nengine:\n  max_attempts: 5\n"
        )
        .unwrap();

        let config = WorkerConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.broker_address, "10.0.0.5:6380");
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.handler_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.engine.max_attempts, 5);
        // Unspecified values fall back to defaults
        assert_eq!(config.engine.visibility_timeout_ms, 60_000);
        assert_eq!(config.log_format, "text");
    }

    #[test]
    fn test_generate_worker_id() {
        let config = WorkerConfig {
            worker_id: Some("worker-a".into()),
            ..WorkerConfig::default()
        };
        assert_eq!(config.generate_worker_id(), "worker-a");

        let generated = WorkerConfig::default().generate_worker_id();
        assert!(generated.contains(&std::process::id().to_string()));
    }
}
