use crate::{cf, PersistenceError, Result, CF_ENVELOPES};
use async_trait::async_trait;
use chrono::Utc;
use jobq_core::config::to_chrono;
use jobq_core::{BrokerQueue, JobEnvelope, JobError, JobId, Lease, QueueDepth};
use rocksdb::DB;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Write-through persistence around an in-process queue.
///
/// Every envelope the inner queue holds is also stored in RocksDB. Leases
/// live only in memory: after a restart every stored envelope is ready
/// again, so work claimed before a crash is redelivered.
pub struct DurableQueue<Q> {
    db: Arc<DB>,
    inner: Q,
    /// Serializes changes that touch both disk and the inner queue
    write_lock: Mutex<()>,
}

impl<Q: BrokerQueue> DurableQueue<Q> {
    /// Wrap `inner`, loading every persisted envelope into it
    pub async fn open(db: Arc<DB>, inner: Q) -> Result<Self> {
        let queue = DurableQueue {
            db,
            inner,
            write_lock: Mutex::new(()),
        };

        let mut envelopes = queue.load_all()?;
        envelopes.sort_by_key(|envelope| (envelope.visible_at, envelope.created_at));

        info!("Loading {} persisted envelopes into queue", envelopes.len());
        for envelope in envelopes {
            match queue.inner.enqueue(envelope).await {
                Ok(()) | Err(JobError::Duplicate(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok(queue)
    }

    pub fn inner(&self) -> &Q {
        &self.inner
    }

    fn load_all(&self) -> Result<Vec<JobEnvelope>> {
        let cf = cf(&self.db, CF_ENVELOPES)?;
        let mut envelopes = Vec::new();

        for item in self.db.iterator_cf(cf, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            envelopes.push(JobEnvelope::from_bytes(&value)?);
        }

        Ok(envelopes)
    }

    fn contains(&self, id: &JobId) -> Result<bool> {
        let cf = cf(&self.db, CF_ENVELOPES)?;
        Ok(self.db.get_pinned_cf(cf, id.as_bytes())?.is_some())
    }

    fn put(&self, envelope: &JobEnvelope) -> Result<()> {
        let cf = cf(&self.db, CF_ENVELOPES)?;
        self.db.put_cf(cf, envelope.id.as_bytes(), envelope.to_bytes()?)?;
        Ok(())
    }

    fn delete(&self, id: &JobId) -> Result<()> {
        let cf = cf(&self.db, CF_ENVELOPES)?;
        self.db.delete_cf(cf, id.as_bytes())?;
        Ok(())
    }
}

#[async_trait]
impl<Q: BrokerQueue> BrokerQueue for DurableQueue<Q> {
    async fn enqueue(&self, envelope: JobEnvelope) -> jobq_core::Result<()> {
        envelope.validate()?;
        let id = envelope.id;
        let _guard = self.write_lock.lock().await;

        if self.contains(&id).map_err(PersistenceError::into_broker_error)? {
            return Err(JobError::Duplicate(id));
        }
        self.put(&envelope)
            .map_err(PersistenceError::into_broker_error)?;

        if let Err(e) = self.inner.enqueue(envelope).await {
            // Keep disk and memory in agreement
            self.delete(&id).map_err(PersistenceError::into_broker_error)?;
            return Err(e);
        }

        debug!(job_id = %id, "Persisted envelope");
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
        let _guard = self.write_lock.lock().await;
        self.inner.ack(lease).await?;
        self.delete(&lease.id())
            .map_err(PersistenceError::into_broker_error)
    }

    async fn nack(&self, lease: Lease, delay: Duration) -> jobq_core::Result<()> {
        let mut stored = lease.envelope.clone();
        stored.visible_at = Utc::now() + to_chrono(delay);

        let _guard = self.write_lock.lock().await;
        self.inner.nack(lease, delay).await?;
        self.put(&stored)
            .map_err(PersistenceError::into_broker_error)
    }

    async fn reap_expired(&self) -> jobq_core::Result<usize> {
        self.inner.reap_expired().await
    }

    async fn depth(&self) -> jobq_core::Result<QueueDepth> {
        self.inner.depth().await
    }
}
