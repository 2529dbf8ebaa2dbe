use crate::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Engine knobs shared by broker, worker and dispatcher configs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default ceiling for `attempt` on submitted jobs
    pub max_attempts: u32,
    /// How long a claim is honored before redelivery
    pub visibility_timeout_ms: u64,
    /// How long a worker blocks waiting for work per claim call
    pub claim_wait_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Retention of terminal records
    pub result_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_attempts: 3,
            visibility_timeout_ms: 60_000,
            claim_wait_ms: 5_000,
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
            result_ttl_secs: 24 * 60 * 60,
        }
    }
}

impl EngineConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: self.backoff_base_ms,
            max_delay_ms: self.backoff_cap_ms,
        }
    }

    pub fn result_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.result_ttl_secs.min(i64::MAX as u64) as i64)
    }
}

/// Convert a std duration for timestamp arithmetic, saturating at a century.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();

        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.visibility_timeout(), Duration::from_secs(60));
        assert_eq!(config.result_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
    }
}
