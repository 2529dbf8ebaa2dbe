use crate::DispatchError;
use jobq_core::{
    BrokerQueue, JobEnvelope, JobError, JobId, JobOutcome, JobRecord, JobState, ResultStore,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Entry point for producers: submits jobs and reads their outcome.
///
/// Submission never waits for execution. The record is written before the
/// envelope is enqueued so a worker claiming it straight away always finds
/// a record to update.
#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<dyn BrokerQueue>,
    store: Arc<dyn ResultStore>,
    default_max_attempts: u32,
    known_handlers: Option<Arc<HashSet<String>>>,
}

impl Dispatcher {
    pub fn new(queue: Arc<dyn BrokerQueue>, store: Arc<dyn ResultStore>) -> Self {
        Dispatcher {
            queue,
            store,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            known_handlers: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Reject submissions for any handler not in `names`
    pub fn with_known_handlers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_handlers = Some(Arc::new(names.into_iter().map(Into::into).collect()));
        self
    }

    pub fn default_max_attempts(&self) -> u32 {
        self.default_max_attempts
    }

    pub async fn submit(&self, handler_name: &str, payload: Value) -> jobq_core::Result<JobId> {
        self.submit_with(handler_name, payload, self.default_max_attempts)
            .await
    }

    /// Submit with an explicit attempt ceiling
    pub async fn submit_with(
        &self,
        handler_name: &str,
        payload: Value,
        max_attempts: u32,
    ) -> jobq_core::Result<JobId> {
        if let Some(known) = &self.known_handlers {
            if !known.contains(handler_name) {
                return Err(JobError::UnknownHandler(handler_name.to_string()));
            }
        }

        let envelope = JobEnvelope::new(handler_name, payload, max_attempts)?;
        let id = envelope.id;

        self.store
            .create(JobRecord::pending(&envelope))
            .await
            .map_err(unavailable)?;

        if let Err(e) = self.queue.enqueue(envelope).await {
            if let Err(cleanup) = self.store.remove(&id).await {
                warn!(job_id = %id, "Failed to remove record of unqueued job: {}", cleanup);
            }
            return Err(unavailable(e));
        }

        info!(job_id = %id, handler = handler_name, "Submitted job");
        Ok(id)
    }

    pub async fn get_status(&self, id: &JobId) -> jobq_core::Result<JobState> {
        Ok(self.store.get(id).await?.current_state())
    }

    /// Outcome of a terminal job, or `NotReady` with the current state
    pub async fn get_result(&self, id: &JobId) -> jobq_core::Result<JobOutcome> {
        let record = self.store.get(id).await?;
        record.outcome().ok_or(JobError::NotReady {
            id: *id,
            state: record.current_state(),
        })
    }

    pub async fn get_record(&self, id: &JobId) -> jobq_core::Result<JobRecord> {
        self.store.get(id).await
    }

    /// Poll `get_result` every `poll` until the job is terminal or `timeout` passes
    pub async fn wait_for_result(
        &self,
        id: &JobId,
        timeout: Duration,
        poll: Duration,
    ) -> Result<JobOutcome, DispatchError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.get_result(id).await {
                Ok(outcome) => return Ok(outcome),
                Err(JobError::NotReady { state, .. }) => {
                    debug!(job_id = %id, state = %state, "Job not ready yet");
                }
                Err(e) => return Err(e.into()),
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(DispatchError::Timeout {
                    id: *id,
                    waited: timeout,
                });
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

/// Any failure to hand a job over surfaces as `BrokerUnavailable`
fn unavailable(e: JobError) -> JobError {
    match e {
        JobError::BrokerUnavailable(_) => e,
        other => JobError::BrokerUnavailable(other.to_string()),
    }
}
