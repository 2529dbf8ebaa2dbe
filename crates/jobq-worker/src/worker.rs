use crate::executor::JobExecutor;
use chrono::Utc;
use jobq_core::config::to_chrono;
use jobq_core::{
    BrokerQueue, JobError, JobEvent, Lease, Resolution, ResultStore, RetryPolicy,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One claim, execute, resolve loop.
///
/// Workers share nothing but the queue, the store and the (read-only)
/// executor. Any number of them may run against the same backends.
pub struct Worker {
    id: String,
    queue: Arc<dyn BrokerQueue>,
    store: Arc<dyn ResultStore>,
    executor: Arc<JobExecutor>,
    retry_policy: RetryPolicy,
    visibility_timeout: Duration,
    claim_wait: Duration,
    error_backoff: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        queue: Arc<dyn BrokerQueue>,
        store: Arc<dyn ResultStore>,
        executor: Arc<JobExecutor>,
    ) -> Self {
        Worker {
            id: id.into(),
            queue,
            store,
            executor,
            retry_policy: RetryPolicy::default(),
            visibility_timeout: Duration::from_secs(60),
            claim_wait: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_claim_wait(mut self, claim_wait: Duration) -> Self {
        self.claim_wait = claim_wait;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` is cancelled. A job in progress is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            let claimed = tokio::select! {
                _ = shutdown.cancelled() => break,
                claimed = self.queue.claim(self.visibility_timeout, self.claim_wait) => claimed,
            };

            let result = match claimed {
                Ok(Some(lease)) => self.process(lease).await,
                Ok(None) => continue,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                error!(worker_id = %self.id, "Worker error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.error_backoff) => {}
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim and process a single envelope without waiting.
    ///
    /// Returns whether an envelope was claimed.
    pub async fn run_once(&self) -> jobq_core::Result<bool> {
        match self.queue.try_claim(self.visibility_timeout).await? {
            Some(lease) => {
                self.process(lease).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process(&self, lease: Lease) -> jobq_core::Result<()> {
        let job_id = lease.id();
        debug!(worker_id = %self.id, job_id = %job_id, "Claimed job");

        let started = JobEvent::Started { lease: lease.token };
        match self.store.apply(&job_id, started).await {
            Ok(record) => debug!(job_id = %job_id, runs = record.runs, "Job running"),
            Err(JobError::TerminalState(_)) => {
                // Outcome was written by a run whose ack never arrived
                info!(job_id = %job_id, "Job already finished, acknowledging redelivery");
                return self.settle(self.queue.ack(&lease).await);
            }
            Err(JobError::NotFound(_)) | Err(JobError::Expired(_)) => {
                warn!(job_id = %job_id, "Dropping orphaned envelope with no job record");
                return self.settle(self.queue.ack(&lease).await);
            }
            Err(e) => return Err(e),
        }

        let outcome = self.executor.execute(&lease.envelope).await;

        match self.retry_policy.decide(&lease.envelope, outcome) {
            Resolution::Complete { result } => {
                let event = JobEvent::Succeeded {
                    lease: lease.token,
                    result,
                };
                if self.record(&lease, event).await? {
                    self.settle(self.queue.ack(&lease).await)?;
                }
            }
            Resolution::Retry {
                attempt,
                delay,
                error,
            } => {
                let retry_at = Utc::now() + to_chrono(delay);
                let event = JobEvent::RetryScheduled {
                    lease: lease.token,
                    attempt,
                    error,
                    retry_at,
                };
                if self.record(&lease, event).await? {
                    let next = lease.envelope.next_attempt()?;
                    info!(job_id = %job_id, attempt, "Retrying job in {:?}", delay);
                    self.settle(self.queue.nack(lease.with_envelope(next), delay).await)?;
                }
            }
            Resolution::Fail { attempt, error } => {
                let event = JobEvent::Failed {
                    lease: lease.token,
                    attempt,
                    error,
                };
                if self.record(&lease, event).await? {
                    self.settle(self.queue.ack(&lease).await)?;
                }
            }
        }

        Ok(())
    }

    /// Write the run's outcome; returns whether the lease should be settled
    async fn record(&self, lease: &Lease, event: JobEvent) -> jobq_core::Result<bool> {
        match self.store.apply(&lease.id(), event).await {
            Ok(_) => Ok(true),
            Err(JobError::TerminalState(_)) => {
                // A redelivered copy finished first
                warn!(job_id = %lease.id(), "Job finished elsewhere, discarding outcome");
                Ok(true)
            }
            Err(JobError::LeaseExpired(_)) => {
                // The envelope was redelivered and a newer run owns the record.
                warn!(worker_id = %self.id, job_id = %lease.id(), "Lease lost mid-run, discarding outcome");
                Ok(false)
            }
            Err(JobError::InvalidTransition { from, event }) => {
                // Another run moved the record on; leave the lease to expire.
                warn!(job_id = %lease.id(), state = %from, "Cannot record {}: job changed underneath", event);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn settle(&self, result: jobq_core::Result<()>) -> jobq_core::Result<()> {
        match result {
            Err(JobError::LeaseExpired(id)) => {
                warn!(worker_id = %self.id, job_id = %id, "Lease expired before settling; job was redelivered");
                Ok(())
            }
            other => other,
        }
    }
}
