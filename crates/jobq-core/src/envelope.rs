use crate::{JobError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unique identifier for a job, shared by queue entry, record and client.
pub type JobId = Uuid;

/// The queued representation of one unit of work.
///
/// Envelopes are treated as values: the worker pool never edits an envelope
/// it holds, it derives a new copy (see [`JobEnvelope::next_attempt`]) and
/// hands that back to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub id: JobId,

    /// Name of the registered handler (e.g., "weather")
    pub handler_name: String,

    /// Handler arguments
    pub payload: Value,

    /// Retries performed so far
    pub attempt: u32,

    /// Ceiling for `attempt`
    pub max_attempts: u32,

    pub created_at: DateTime<Utc>,

    /// Earliest time the envelope may be delivered
    pub visible_at: DateTime<Utc>,
}

impl JobEnvelope {
    /// Create an envelope that is visible immediately
    pub fn new(handler_name: impl Into<String>, payload: Value, max_attempts: u32) -> Result<Self> {
        Self::builder(handler_name, payload)
            .max_attempts(max_attempts)
            .build()
    }

    pub fn builder(handler_name: impl Into<String>, payload: Value) -> JobEnvelopeBuilder {
        JobEnvelopeBuilder::new(handler_name.into(), payload)
    }

    /// Serialize to the JSON wire form
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(JobError::from)
    }

    /// Deserialize from the JSON wire form, checking invariants
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: JobEnvelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn validate(&self) -> Result<()> {
        if self.handler_name.trim().is_empty() {
            return Err(JobError::InvalidEnvelope("handler_name is empty".to_string()));
        }
        if self.max_attempts == 0 {
            return Err(JobError::InvalidEnvelope("max_attempts must be at least 1".to_string()));
        }
        if self.attempt > self.max_attempts {
            return Err(JobError::AttemptsExhausted {
                attempt: self.attempt,
                max: self.max_attempts,
            });
        }
        Ok(())
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }

    /// Copy of this envelope with `attempt` advanced by one
    pub fn next_attempt(&self) -> Result<Self> {
        let attempt = self.attempt + 1;
        if attempt > self.max_attempts {
            return Err(JobError::AttemptsExhausted {
                attempt,
                max: self.max_attempts,
            });
        }

        Ok(JobEnvelope {
            attempt,
            ..self.clone()
        })
    }
}

pub struct JobEnvelopeBuilder {
    handler_name: String,
    payload: Value,
    max_attempts: u32,
    visible_at: Option<DateTime<Utc>>,
    id: Option<JobId>,
}

impl JobEnvelopeBuilder {
    pub fn new(handler_name: String, payload: Value) -> Self {
        JobEnvelopeBuilder {
            handler_name,
            payload,
            max_attempts: 3,
            visible_at: None,
            id: None,
        }
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = Some(visible_at);
        self
    }

    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn build(self) -> Result<JobEnvelope> {
        let now = Utc::now();
        let envelope = JobEnvelope {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            handler_name: self.handler_name,
            payload: self.payload,
            attempt: 0,
            max_attempts: self.max_attempts,
            created_at: now,
            visible_at: self.visible_at.unwrap_or(now),
        };
        envelope.validate()?;
        Ok(envelope)
    }
}
