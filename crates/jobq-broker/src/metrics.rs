use async_trait::async_trait;
use jobq_core::{
    BrokerQueue, JobEnvelope, JobEvent, JobId, JobRecord, JobState, Lease, QueueDepth,
    ResultStore,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Duration;

/// Prometheus metrics for the broker
pub struct BrokerMetrics {
    pub registry: Registry,

    pub jobs_submitted: IntCounter,

    /// Terminal outcomes by `outcome` (succeeded / failed)
    pub jobs_finished: IntCounterVec,

    /// Queue occupancy by `state` (ready / delayed / leased)
    pub queue_depth: IntGaugeVec,

    pub leases_reaped: IntCounter,
    pub records_purged: IntCounter,
}

impl BrokerMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let jobs_submitted =
            IntCounter::new("jobq_jobs_submitted_total", "Total number of submitted jobs")?;
        registry.register(Box::new(jobs_submitted.clone()))?;

        let jobs_finished = IntCounterVec::new(
            Opts::new("jobq_jobs_finished_total", "Jobs that reached a terminal state"),
            &["outcome"],
        )?;
        registry.register(Box::new(jobs_finished.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("jobq_queue_depth", "Envelopes held by the broker queue"),
            &["state"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        let leases_reaped = IntCounter::new(
            "jobq_leases_reaped_total",
            "Leases that expired and were returned to the queue",
        )?;
        registry.register(Box::new(leases_reaped.clone()))?;

        let records_purged = IntCounter::new(
            "jobq_records_purged_total",
            "Terminal records removed after their time-to-live",
        )?;
        registry.register(Box::new(records_purged.clone()))?;

        Ok(BrokerMetrics {
            registry,
            jobs_submitted,
            jobs_finished,
            queue_depth,
            leases_reaped,
            records_purged,
        })
    }

    pub fn update_queue_depth(&self, depth: &QueueDepth) {
        self.queue_depth
            .with_label_values(&["ready"])
            .set(depth.ready as i64);
        self.queue_depth
            .with_label_values(&["delayed"])
            .set(depth.delayed as i64);
        self.queue_depth
            .with_label_values(&["leased"])
            .set(depth.leased as i64);
    }

    pub fn inc_finished(&self, state: JobState) {
        self.jobs_finished.with_label_values(&[state.as_str()]).inc();
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> anyhow::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Queue wrapper counting submissions.
///
/// A job counts once its envelope is accepted. Redeliveries go through
/// `nack` and are not counted again.
pub struct MeteredQueue {
    inner: Arc<dyn BrokerQueue>,
    metrics: Arc<BrokerMetrics>,
}

impl MeteredQueue {
    pub fn new(inner: Arc<dyn BrokerQueue>, metrics: Arc<BrokerMetrics>) -> Self {
        MeteredQueue { inner, metrics }
    }
}

#[async_trait]
impl BrokerQueue for MeteredQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> jobq_core::Result<()> {
        self.inner.enqueue(envelope).await?;
        self.metrics.jobs_submitted.inc();
        Ok(())
    }

    async fn try_claim(&self, visibility_timeout: Duration) -> jobq_core::Result<Option<Lease>> {
        self.inner.try_claim(visibility_timeout).await
    }

    async fn claim(
        &self,
        visibility_timeout: Duration,
        wait: Duration,
    ) -> jobq_core::Result<Option<Lease>> {
        self.inner.claim(visibility_timeout, wait).await
    }

    async fn ack(&self, lease: &Lease) -> jobq_core::Result<()> {
        self.inner.ack(lease).await
    }

    async fn nack(&self, lease: Lease, delay: Duration) -> jobq_core::Result<()> {
        self.inner.nack(lease, delay).await
    }

    async fn reap_expired(&self) -> jobq_core::Result<usize> {
        self.inner.reap_expired().await
    }

    async fn depth(&self) -> jobq_core::Result<QueueDepth> {
        self.inner.depth().await
    }
}

/// Result store wrapper counting terminal outcomes and purges.
///
/// Every writer (REST, remote workers, embedded workers) goes through the
/// broker's store, so counting here sees every job exactly once.
pub struct MeteredStore {
    inner: Arc<dyn ResultStore>,
    metrics: Arc<BrokerMetrics>,
}

impl MeteredStore {
    pub fn new(inner: Arc<dyn ResultStore>, metrics: Arc<BrokerMetrics>) -> Self {
        MeteredStore { inner, metrics }
    }
}

#[async_trait]
impl ResultStore for MeteredStore {
    async fn create(&self, record: JobRecord) -> jobq_core::Result<()> {
        self.inner.create(record).await
    }

    async fn get(&self, id: &JobId) -> jobq_core::Result<JobRecord> {
        self.inner.get(id).await
    }

    async fn apply(&self, id: &JobId, event: JobEvent) -> jobq_core::Result<JobRecord> {
        let record = self.inner.apply(id, event).await?;
        if record.is_terminal() {
            self.metrics.inc_finished(record.state);
        }
        Ok(record)
    }

    async fn remove(&self, id: &JobId) -> jobq_core::Result<()> {
        self.inner.remove(id).await
    }

    async fn list(&self, handler_name: &str, state: JobState) -> jobq_core::Result<Vec<JobRecord>> {
        self.inner.list(handler_name, state).await
    }

    async fn purge_expired(&self) -> jobq_core::Result<usize> {
        let purged = self.inner.purge_expired().await?;
        self.metrics.records_purged.inc_by(purged as u64);
        Ok(purged)
    }
}
