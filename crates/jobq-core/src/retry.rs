//! Retry policy and the resolution of a handler run.

use crate::JobEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Tagged result of running a handler once
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Succeeded(Value),
    /// Transient failure, worth another attempt
    RecoverableFailure(String),
    /// Permanent failure, retrying cannot help
    UnrecoverableFailure(String),
}

/// What the worker must do with a finished run
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Complete { result: Value },
    Retry {
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Fail { attempt: u32, error: String },
}

/// Exponential backoff: a job whose attempt counter was just raised to `n`
/// waits `base * 2^n`, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        RetryPolicy {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: cap.as_millis() as u64,
        }
    }

    /// Delay before the run following failure number `attempt`.
    ///
    /// `attempt` is the counter after the increment, so the first retry
    /// already waits `2 * base`.
    pub fn delay_for_retry(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63);
        let delay = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Decide the next step for `envelope` given how its run ended
    pub fn decide(&self, envelope: &JobEnvelope, outcome: ExecutionOutcome) -> Resolution {
        match outcome {
            ExecutionOutcome::Succeeded(result) => Resolution::Complete { result },
            ExecutionOutcome::UnrecoverableFailure(error) => Resolution::Fail {
                attempt: envelope.attempt,
                error,
            },
            ExecutionOutcome::RecoverableFailure(error) => {
                let attempt = (envelope.attempt + 1).min(envelope.max_attempts);
                if attempt < envelope.max_attempts {
                    Resolution::Retry {
                        attempt,
                        delay: self.delay_for_retry(attempt),
                        error,
                    }
                } else {
                    Resolution::Fail { attempt, error }
                }
            }
        }
    }
}
