use crate::{JobId, JobState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// The lease was lost to expiry; the envelope will be (or was) redelivered.
    #[error("Lease expired for job {0}")]
    LeaseExpired(JobId),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job expired: {0}")]
    Expired(JobId),

    #[error("Job {id} is not ready (state: {state})")]
    NotReady { id: JobId, state: JobState },

    #[error("Job already exists: {0}")]
    Duplicate(JobId),

    #[error("Invalid transition from {from} on {event}")]
    InvalidTransition { from: JobState, event: String },

    #[error("Job {0} is in a terminal state")]
    TerminalState(JobId),

    #[error("Attempt {attempt} exceeds maximum of {max}")]
    AttemptsExhausted { attempt: u32, max: u32 },

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl JobError {
    /// Errors a caller may reasonably retry later without changing the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobError::BrokerUnavailable(_) | JobError::Storage(_))
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
