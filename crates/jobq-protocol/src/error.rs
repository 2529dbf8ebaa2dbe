//! Engine errors on the wire.

use jobq_core::{JobError, JobId, JobState};
use serde::{Deserialize, Serialize};

/// Error taxonomy carried by an `Error` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorKind {
    BrokerUnavailable,
    LeaseExpired { id: JobId },
    NotFound { id: JobId },
    Expired { id: JobId },
    NotReady { id: JobId, state: JobState },
    Duplicate { id: JobId },
    InvalidTransition { from: JobState, event: String },
    TerminalState { id: JobId },
    AttemptsExhausted { attempt: u32, max: u32 },
    InvalidEnvelope,
    UnknownHandler,
    Serialization,
    Storage,
    /// The request itself could not be served (malformed or unexpected frame)
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorResponse {
    pub fn protocol(message: impl Into<String>) -> Self {
        ErrorResponse {
            kind: ErrorKind::Protocol,
            message: message.into(),
        }
    }

    /// Rebuild the engine error on the receiving side
    pub fn into_job_error(self) -> JobError {
        let ErrorResponse { kind, message } = self;
        match kind {
            ErrorKind::BrokerUnavailable => JobError::BrokerUnavailable(message),
            ErrorKind::LeaseExpired { id } => JobError::LeaseExpired(id),
            ErrorKind::NotFound { id } => JobError::NotFound(id),
            ErrorKind::Expired { id } => JobError::Expired(id),
            ErrorKind::NotReady { id, state } => JobError::NotReady { id, state },
            ErrorKind::Duplicate { id } => JobError::Duplicate(id),
            ErrorKind::InvalidTransition { from, event } => {
                JobError::InvalidTransition { from, event }
            }
            ErrorKind::TerminalState { id } => JobError::TerminalState(id),
            ErrorKind::AttemptsExhausted { attempt, max } => {
                JobError::AttemptsExhausted { attempt, max }
            }
            ErrorKind::InvalidEnvelope => JobError::InvalidEnvelope(message),
            ErrorKind::UnknownHandler => JobError::UnknownHandler(message),
            ErrorKind::Serialization => JobError::Storage(format!("remote serialization: {message}")),
            ErrorKind::Storage => JobError::Storage(message),
            ErrorKind::Protocol => JobError::BrokerUnavailable(format!("protocol: {message}")),
        }
    }
}

impl From<&JobError> for ErrorResponse {
    fn from(error: &JobError) -> Self {
        let (kind, message) = match error {
            JobError::BrokerUnavailable(msg) => (ErrorKind::BrokerUnavailable, msg.clone()),
            JobError::LeaseExpired(id) => (ErrorKind::LeaseExpired { id: *id }, error.to_string()),
            JobError::NotFound(id) => (ErrorKind::NotFound { id: *id }, error.to_string()),
            JobError::Expired(id) => (ErrorKind::Expired { id: *id }, error.to_string()),
            JobError::NotReady { id, state } => (
                ErrorKind::NotReady {
                    id: *id,
                    state: *state,
                },
                error.to_string(),
            ),
            JobError::Duplicate(id) => (ErrorKind::Duplicate { id: *id }, error.to_string()),
            JobError::InvalidTransition { from, event } => (
                ErrorKind::InvalidTransition {
                    from: *from,
                    event: event.clone(),
                },
                error.to_string(),
            ),
            JobError::TerminalState(id) => (ErrorKind::TerminalState { id: *id }, error.to_string()),
            JobError::AttemptsExhausted { attempt, max } => (
                ErrorKind::AttemptsExhausted {
                    attempt: *attempt,
                    max: *max,
                },
                error.to_string(),
            ),
            JobError::InvalidEnvelope(msg) => (ErrorKind::InvalidEnvelope, msg.clone()),
            JobError::UnknownHandler(name) => (ErrorKind::UnknownHandler, name.clone()),
            JobError::Serialization(e) => (ErrorKind::Serialization, e.to_string()),
            JobError::Storage(msg) => (ErrorKind::Storage, msg.clone()),
        };
        ErrorResponse { kind, message }
    }
}
