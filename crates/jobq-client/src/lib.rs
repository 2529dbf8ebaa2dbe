mod dispatcher;
mod remote;

pub use dispatcher::Dispatcher;
pub use remote::RemoteBroker;

use jobq_core::{JobError, JobId};
use std::time::Duration;
use thiserror::Error;

/// Transport failures talking to a broker
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ClientError {
    /// Every transport failure reads as an unreachable broker to the engine
    pub fn into_job_error(self) -> JobError {
        JobError::BrokerUnavailable(self.to_string())
    }
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("Timed out waiting for job {id} after {waited:?}")]
    Timeout { id: JobId, waited: Duration },
}

pub type Result<T> = std::result::Result<T, ClientError>;
