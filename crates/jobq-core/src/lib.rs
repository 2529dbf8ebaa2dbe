mod envelope;
mod record;
mod retry;
mod error;
pub mod config;
pub mod queue;
pub mod store;

pub use envelope::{JobEnvelope, JobEnvelopeBuilder, JobId};
pub use record::{JobEvent, JobOutcome, JobRecord, JobState};
pub use retry::{ExecutionOutcome, Resolution, RetryPolicy};
pub use error::{JobError, Result};
pub use config::EngineConfig;
pub use queue::{BrokerQueue, Lease, LeaseToken, MemoryQueue, QueueDepth};
pub use store::{MemoryResultStore, ResultStore};

/// Handler name of the weather lookup job
pub const WEATHER_HANDLER: &str = "weather";
