use crate::{JobEnvelope, JobError, JobId, LeaseToken, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued, waiting for a worker
    Pending,
    /// Claimed by a worker
    Running,
    /// Failed recoverably, waiting out the backoff delay
    Retrying,
    /// Handler produced a result
    Succeeded,
    /// Handler failed for good
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Retrying => "retrying",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "retrying" => Ok(JobState::Retrying),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// A state change requested by the worker that owns the job.
///
/// Every event carries the token of the lease it was produced under. Outcome
/// events are only accepted from the lease that last started the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// Worker claimed the envelope and is about to run the handler
    Started { lease: LeaseToken },
    Succeeded { lease: LeaseToken, result: Value },
    Failed {
        lease: LeaseToken,
        attempt: u32,
        error: String,
    },
    RetryScheduled {
        lease: LeaseToken,
        attempt: u32,
        error: String,
        retry_at: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::Started { .. } => "started",
            JobEvent::Succeeded { .. } => "succeeded",
            JobEvent::Failed { .. } => "failed",
            JobEvent::RetryScheduled { .. } => "retry_scheduled",
        }
    }
}

/// Final outcome of a terminal job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { result: Value },
    Failed { error: String },
}

/// Result store entry for one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub handler_name: String,
    pub state: JobState,
    pub attempt: u32,
    pub max_attempts: u32,

    /// Number of times the job entered `Running`
    pub runs: u32,

    /// Set iff state is `Succeeded`
    pub result: Option<Value>,

    /// Set iff state is `Failed`
    pub error: Option<String>,

    /// Most recent recoverable error, kept for diagnostics while retrying
    pub last_error: Option<String>,

    /// When a `Retrying` job becomes claimable again
    pub retry_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set on entering a terminal state
    pub expires_at: Option<DateTime<Utc>>,

    /// Lease of the run currently allowed to report an outcome
    #[serde(default)]
    pub lease: Option<LeaseToken>,
}

impl JobRecord {
    /// Fresh `Pending` record for an envelope about to be enqueued
    pub fn pending(envelope: &JobEnvelope) -> Self {
        let now = Utc::now();
        JobRecord {
            id: envelope.id,
            handler_name: envelope.handler_name.clone(),
            state: JobState::Pending,
            attempt: envelope.attempt,
            max_attempts: envelope.max_attempts,
            runs: 0,
            result: None,
            error: None,
            last_error: None,
            retry_at: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
            lease: None,
        }
    }

    /// State as observed at `now`; a due `Retrying` job reads as `Pending`.
    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        match (self.state, self.retry_at) {
            (JobState::Retrying, Some(retry_at)) if retry_at <= now => JobState::Pending,
            (state, _) => state,
        }
    }

    pub fn current_state(&self) -> JobState {
        self.state_at(Utc::now())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Succeeded => Some(JobOutcome::Succeeded {
                result: self.result.clone().unwrap_or(Value::Null),
            }),
            JobState::Failed => Some(JobOutcome::Failed {
                error: self.error.clone().unwrap_or_default(),
            }),
            _ => None,
        }
    }

    /// Apply a lifecycle event, enforcing the state machine.
    ///
    /// Terminal records reject every event. An outcome event whose lease is
    /// not the one that last started the job fails with `LeaseExpired` and
    /// leaves the record untouched. `ttl` is the retention period started
    /// when the record becomes terminal.
    pub fn apply(&mut self, event: JobEvent, now: DateTime<Utc>, ttl: Duration) -> Result<()> {
        if self.is_terminal() {
            return Err(JobError::TerminalState(self.id));
        }

        match event {
            JobEvent::Started { lease } => {
                // Running -> Running is a redelivery after a lost lease.
                self.state = JobState::Running;
                self.runs += 1;
                self.retry_at = None;
                self.lease = Some(lease);
            }
            JobEvent::Succeeded { lease, result } => {
                self.expect_owner("succeeded", lease)?;
                self.state = JobState::Succeeded;
                self.result = Some(result);
                self.expires_at = Some(now + ttl);
            }
            JobEvent::Failed {
                lease,
                attempt,
                error,
            } => {
                self.expect_owner("failed", lease)?;
                self.check_attempt(attempt)?;
                self.state = JobState::Failed;
                self.attempt = attempt;
                self.error = Some(error);
                self.expires_at = Some(now + ttl);
            }
            JobEvent::RetryScheduled {
                lease,
                attempt,
                error,
                retry_at,
            } => {
                self.expect_owner("retry_scheduled", lease)?;
                self.check_attempt(attempt)?;
                if attempt >= self.max_attempts {
                    return Err(JobError::AttemptsExhausted {
                        attempt,
                        max: self.max_attempts,
                    });
                }
                self.state = JobState::Retrying;
                self.attempt = attempt;
                self.last_error = Some(error);
                self.retry_at = Some(retry_at);
            }
        }

        self.updated_at = now;
        Ok(())
    }

    /// Outcome events need a running job started under the same lease.
    fn expect_owner(&self, event: &str, lease: LeaseToken) -> Result<()> {
        if self.state != JobState::Running {
            return Err(JobError::InvalidTransition {
                from: self.state,
                event: event.to_string(),
            });
        }
        if self.lease != Some(lease) {
            return Err(JobError::LeaseExpired(self.id));
        }
        Ok(())
    }

    fn check_attempt(&self, attempt: u32) -> Result<()> {
        if attempt > self.max_attempts {
            return Err(JobError::AttemptsExhausted {
                attempt,
                max: self.max_attempts,
            });
        }
        if attempt < self.attempt {
            return Err(JobError::InvalidTransition {
                from: self.state,
                event: format!("attempt regression {} -> {}", self.attempt, attempt),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn record(max_attempts: u32) -> JobRecord {
        let envelope = JobEnvelope::new("weather", json!({}), max_attempts).unwrap();
        JobRecord::pending(&envelope)
    }

    fn ttl() -> Duration {
        Duration::hours(24)
    }

    #[test]
    fn test_success_path() {
        let mut rec = record(3);
        let now = Utc::now();
        let lease = LeaseToken::new();

        rec.apply(JobEvent::Started { lease }, now, ttl()).unwrap();
        assert_eq!(rec.state, JobState::Running);
        assert_eq!(rec.lease, Some(lease));

        rec.apply(
            JobEvent::Succeeded { lease, result: json!({"ok": true}) },
            now,
            ttl(),
        )
        .unwrap();
        assert_eq!(rec.state, JobState::Succeeded);
        assert_eq!(rec.result, Some(json!({"ok": true})));
        assert!(rec.error.is_none());
        assert_eq!(rec.expires_at, Some(now + ttl()));
        assert_eq!(rec.runs, 1);
    }

    #[test]
    fn test_cannot_skip_running() {
        let mut rec = record(3);
        let result = rec.apply(
            JobEvent::Succeeded { lease: LeaseToken::new(), result: json!(1) },
            Utc::now(),
            ttl(),
        );

        assert!(matches!(
            result,
            Err(JobError::InvalidTransition { from: JobState::Pending, .. })
        ));
        assert_eq!(rec.state, JobState::Pending);
    }

    #[test]
    fn test_stale_lease_cannot_report() {
        let mut rec = record(3);
        let now = Utc::now();
        let stale = LeaseToken::new();
        let current = LeaseToken::new();

        // First claim expired and the envelope was redelivered.
        rec.apply(JobEvent::Started { lease: stale }, now, ttl()).unwrap();
        rec.apply(JobEvent::Started { lease: current }, now, ttl()).unwrap();
        let snapshot = rec.clone();

        let retry = rec.apply(
            JobEvent::RetryScheduled {
                lease: stale,
                attempt: 1,
                error: "503".into(),
                retry_at: now,
            },
            now,
            ttl(),
        );
        assert!(matches!(retry, Err(JobError::LeaseExpired(id)) if id == rec.id));
        let failed = rec.apply(
            JobEvent::Failed { lease: stale, attempt: 1, error: "503".into() },
            now,
            ttl(),
        );
        assert!(matches!(failed, Err(JobError::LeaseExpired(_))));
        assert_eq!(rec, snapshot);

        rec.apply(
            JobEvent::Succeeded { lease: current, result: json!("sunny") },
            now,
            ttl(),
        )
        .unwrap();
        assert_eq!(rec.state, JobState::Succeeded);
        assert_eq!(rec.runs, 2);
    }

    #[test]
    fn test_terminal_is_write_once() {
        let mut rec = record(3);
        let now = Utc::now();
        let lease = LeaseToken::new();
        rec.apply(JobEvent::Started { lease }, now, ttl()).unwrap();
        rec.apply(
            JobEvent::Failed { lease, attempt: 0, error: "boom".into() },
            now,
            ttl(),
        )
        .unwrap();

        let snapshot = rec.clone();
        for event in [
            JobEvent::Started { lease: LeaseToken::new() },
            JobEvent::Succeeded { lease, result: json!(1) },
            JobEvent::Failed { lease, attempt: 1, error: "again".into() },
        ] {
            assert!(matches!(
                rec.apply(event, Utc::now(), ttl()),
                Err(JobError::TerminalState(_))
            ));
        }
        assert_eq!(rec, snapshot);
    }

    #[test]
    fn test_retrying_reads_pending_once_due() {
        let mut rec = record(3);
        let now = Utc::now();
        let retry_at = now + Duration::seconds(10);
        let lease = LeaseToken::new();

        rec.apply(JobEvent::Started { lease }, now, ttl()).unwrap();
        rec.apply(
            JobEvent::RetryScheduled { lease, attempt: 1, error: "503".into(), retry_at },
            now,
            ttl(),
        )
        .unwrap();

        assert_eq!(rec.state_at(now), JobState::Retrying);
        assert_eq!(rec.state_at(retry_at), JobState::Pending);
        assert_eq!(rec.last_error.as_deref(), Some("503"));
        assert!(rec.error.is_none());

        let next = LeaseToken::new();
        rec.apply(JobEvent::Started { lease: next }, retry_at, ttl()).unwrap();
        assert_eq!(rec.state, JobState::Running);
        assert_eq!(rec.runs, 2);
        assert_eq!(rec.lease, Some(next));
        assert!(rec.retry_at.is_none());
    }

    #[test]
    fn test_retry_at_ceiling_is_rejected() {
        let mut rec = record(2);
        let now = Utc::now();
        let lease = LeaseToken::new();
        rec.apply(JobEvent::Started { lease }, now, ttl()).unwrap();

        let result = rec.apply(
            JobEvent::RetryScheduled { lease, attempt: 2, error: "x".into(), retry_at: now },
            now,
            ttl(),
        );
        assert!(matches!(result, Err(JobError::AttemptsExhausted { attempt: 2, max: 2 })));
    }

    #[test]
    fn test_outcome() {
        let mut rec = record(1);
        assert!(rec.outcome().is_none());

        let now = Utc::now();
        let lease = LeaseToken::new();
        rec.apply(JobEvent::Started { lease }, now, ttl()).unwrap();
        rec.apply(
            JobEvent::Failed { lease, attempt: 1, error: "gone".into() },
            now,
            ttl(),
        )
        .unwrap();

        assert_eq!(rec.outcome(), Some(JobOutcome::Failed { error: "gone".into() }));
    }

    #[test]
    fn test_state_strings() {
        for state in [
            JobState::Pending,
            JobState::Running,
            JobState::Retrying,
            JobState::Succeeded,
            JobState::Failed,
        ] {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
            assert_eq!(state.to_string(), state.as_str());
        }
        assert!("dead_letter".parse::<JobState>().is_err());
    }

    #[test]
    fn test_record_without_lease_field_deserializes() {
        let mut value = serde_json::to_value(record(3)).unwrap();
        value.as_object_mut().unwrap().remove("lease");

        let rec: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(rec.lease, None);
    }

    proptest! {
        /// Whatever sequence of attempts a worker reports, the recorded
        /// attempt never decreases and never passes the ceiling.
        #[test]
        fn attempt_is_monotonic(max in 1u32..6, reported in proptest::collection::vec(0u32..8, 1..12)) {
            let mut rec = record(max);
            let now = Utc::now();
            let mut previous = rec.attempt;

            for attempt in reported {
                if rec.is_terminal() {
                    break;
                }
                let lease = LeaseToken::new();
                rec.apply(JobEvent::Started { lease }, now, ttl()).unwrap();
                let _ = rec.apply(
                    JobEvent::RetryScheduled { lease, attempt, error: "e".into(), retry_at: now },
                    now,
                    ttl(),
                );
                prop_assert!(rec.attempt >= previous);
                prop_assert!(rec.attempt <= rec.max_attempts);
                previous = rec.attempt;
            }
        }
    }
}
