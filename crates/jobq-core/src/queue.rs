//! Broker queue contract and the in-memory implementation.

use crate::config::to_chrono;
use crate::{JobEnvelope, JobError, JobId, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

/// Poll interval of the default blocking `claim`
pub const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Identifies one particular claim of an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        LeaseToken(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Temporary exclusive claim on an envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub envelope: JobEnvelope,
    pub token: LeaseToken,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn id(&self) -> JobId {
        self.envelope.id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Same lease carrying a replacement envelope copy (used for retries)
    pub fn with_envelope(self, envelope: JobEnvelope) -> Self {
        Lease { envelope, ..self }
    }
}

/// Queue occupancy snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    /// Visible and unclaimed
    pub ready: usize,
    /// Waiting for `visible_at`
    pub delayed: usize,
    /// Claimed, not yet acknowledged
    pub leased: usize,
}

impl QueueDepth {
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.leased
    }
}

/// Ordered, leasing hand-off channel between producers and workers.
///
/// Delivery is at-least-once: an envelope whose lease runs out before `ack`
/// is handed out again. At most one lease per envelope is active at a time.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    /// Store an envelope for delivery at its `visible_at`
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<()>;

    /// Lease one ready envelope, or `None` without waiting
    async fn try_claim(&self, visibility_timeout: Duration) -> Result<Option<Lease>>;

    /// Lease one ready envelope, waiting up to `wait` for one to appear
    async fn claim(&self, visibility_timeout: Duration, wait: Duration) -> Result<Option<Lease>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            if let Some(lease) = self.try_claim(visibility_timeout).await? {
                return Ok(Some(lease));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            tokio::time::sleep(CLAIM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Remove a processed envelope for good
    async fn ack(&self, lease: &Lease) -> Result<()>;

    /// Release the lease and store `lease.envelope` for redelivery after `delay`
    async fn nack(&self, lease: Lease, delay: Duration) -> Result<()>;

    /// Return expired leases to the ready set
    async fn reap_expired(&self) -> Result<usize>;

    async fn depth(&self) -> Result<QueueDepth>;
}

type ReadyKey = (DateTime<Utc>, u64);

enum Slot {
    Queued(ReadyKey),
    Leased {
        token: LeaseToken,
        expires_at: DateTime<Utc>,
    },
}

struct Entry {
    envelope: JobEnvelope,
    slot: Slot,
}

#[derive(Default)]
struct QueueState {
    /// Ordered by readiness time, then insertion sequence (FIFO)
    ready: BTreeMap<ReadyKey, JobId>,
    /// Active leases ordered by deadline
    leased: BTreeSet<(DateTime<Utc>, JobId)>,
    entries: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl QueueState {
    fn push_ready(&mut self, envelope: JobEnvelope) {
        let key = (envelope.visible_at, self.next_seq);
        self.next_seq += 1;
        self.ready.insert(key, envelope.id);
        self.entries.insert(
            envelope.id,
            Entry {
                envelope,
                slot: Slot::Queued(key),
            },
        );
    }

    /// Remove a leased entry along with its deadline
    fn release(&mut self, id: &JobId) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        if let Slot::Leased { expires_at, .. } = entry.slot {
            self.leased.remove(&(expires_at, *id));
        }
        Some(entry)
    }

    fn reap(&mut self, now: DateTime<Utc>) -> usize {
        let mut reaped = 0;
        while let Some(&(expires_at, id)) = self.leased.first() {
            if expires_at > now {
                break;
            }
            self.leased.remove(&(expires_at, id));

            if let Some(mut entry) = self.entries.remove(&id) {
                entry.envelope.visible_at = expires_at;
                warn!(job_id = %id, "Lease expired, returning envelope to queue");
                self.push_ready(entry.envelope);
                reaped += 1;
            }
        }
        reaped
    }

    fn pop_ready(&mut self, now: DateTime<Utc>, visibility_timeout: Duration) -> Option<Lease> {
        let (&key, &id) = self.ready.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.ready.remove(&key);

        let entry = self.entries.get_mut(&id)?;
        let token = LeaseToken::new();
        let expires_at = now + to_chrono(visibility_timeout);
        entry.slot = Slot::Leased { token, expires_at };
        self.leased.insert((expires_at, id));

        Some(Lease {
            envelope: entry.envelope.clone(),
            token,
            expires_at,
        })
    }

    fn check_lease(&self, lease: &Lease) -> Result<&Entry> {
        match self.entries.get(&lease.id()) {
            Some(entry) => match entry.slot {
                Slot::Leased { token, .. } if token == lease.token => Ok(entry),
                _ => Err(JobError::LeaseExpired(lease.id())),
            },
            None => Err(JobError::LeaseExpired(lease.id())),
        }
    }

    /// Earliest moment something could become claimable
    fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let next_ready = self.ready.keys().next().map(|key| key.0);
        let next_expiry = self.leased.first().map(|(expires_at, _)| *expires_at);

        match (next_ready, next_expiry) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn depth(&self, now: DateTime<Utc>) -> QueueDepth {
        let mut depth = QueueDepth::default();
        for entry in self.entries.values() {
            match entry.slot {
                Slot::Queued((visible_at, _)) if visible_at <= now => depth.ready += 1,
                Slot::Queued(_) => depth.delayed += 1,
                Slot::Leased { .. } => depth.leased += 1,
            }
        }
        depth
    }
}

/// In-process queue; blocking claims are woken by enqueue and nack
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Number of envelopes held, leased or not
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.state.lock().entries.contains_key(id)
    }

    fn claim_now(&self, visibility_timeout: Duration) -> (Option<Lease>, Option<DateTime<Utc>>) {
        let now = Utc::now();
        let mut state = self.state.lock();
        if state.reap(now) > 0 {
            self.notify.notify_waiters();
        }

        let lease = state.pop_ready(now, visibility_timeout);
        (lease, state.next_wakeup())
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerQueue for MemoryQueue {
    async fn enqueue(&self, envelope: JobEnvelope) -> Result<()> {
        envelope.validate()?;
        let id = envelope.id;

        {
            let mut state = self.state.lock();
            if state.entries.contains_key(&id) {
                return Err(JobError::Duplicate(id));
            }
            state.push_ready(envelope);
        }

        self.notify.notify_waiters();
        debug!(job_id = %id, "Enqueued envelope");
        Ok(())
    }

    async fn try_claim(&self, visibility_timeout: Duration) -> Result<Option<Lease>> {
        Ok(self.claim_now(visibility_timeout).0)
    }

    async fn claim(&self, visibility_timeout: Duration, wait: Duration) -> Result<Option<Lease>> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before looking, so a concurrent enqueue cannot slip by.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (lease, next_wakeup) = self.claim_now(visibility_timeout);
            if let Some(lease) = lease {
                debug!(job_id = %lease.id(), "Claimed envelope");
                return Ok(Some(lease));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let mut sleep_for = deadline - now;
            if let Some(at) = next_wakeup {
                let until = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                sleep_for = sleep_for.min(until.max(Duration::from_millis(1)));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let mut state = self.state.lock();
        state.reap(Utc::now());
        state.check_lease(lease)?;
        state.release(&lease.id());

        debug!(job_id = %lease.id(), "Acknowledged envelope");
        Ok(())
    }

    async fn nack(&self, lease: Lease, delay: Duration) -> Result<()> {
        let id = lease.id();
        let now = Utc::now();

        {
            let mut state = self.state.lock();
            state.reap(now);
            let stored_attempt = state.check_lease(&lease)?.envelope.attempt;

            let mut envelope = lease.envelope;
            if envelope.attempt < stored_attempt {
                return Err(JobError::InvalidEnvelope(format!(
                    "attempt regression {} -> {}",
                    stored_attempt, envelope.attempt
                )));
            }
            envelope.validate()?;
            envelope.visible_at = now + to_chrono(delay);

            state.release(&id);
            state.push_ready(envelope);
        }

        self.notify.notify_waiters();
        debug!(job_id = %id, delay_ms = delay.as_millis() as u64, "Released envelope");
        Ok(())
    }

    async fn reap_expired(&self) -> Result<usize> {
        let reaped = self.state.lock().reap(Utc::now());
        if reaped > 0 {
            self.notify.notify_waiters();
        }
        Ok(reaped)
    }

    async fn depth(&self) -> Result<QueueDepth> {
        Ok(self.state.lock().depth(Utc::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;

    const VISIBILITY: Duration = Duration::from_secs(30);

    fn envelope(name: &str) -> JobEnvelope {
        JobEnvelope::new(name, json!({"name": name}), 3).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_within_equal_visibility() {
        let queue = MemoryQueue::new();
        let now = Utc::now() - chrono::Duration::seconds(1);

        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let env = JobEnvelope::builder(name, json!({}))
                .visible_at(now)
                .build()
                .unwrap();
            ids.push(env.id);
            queue.enqueue(env).await.unwrap();
        }

        for id in ids {
            assert_eq!(queue.try_claim(VISIBILITY).await.unwrap().unwrap().id(), id);
        }
        assert!(queue.try_claim(VISIBILITY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_envelope_not_delivered_early() {
        let queue = MemoryQueue::new();
        let future = JobEnvelope::builder("later", json!({}))
            .visible_at(Utc::now() + chrono::Duration::hours(1))
            .build()
            .unwrap();
        let immediate = envelope("now");

        queue.enqueue(future).await.unwrap();
        queue.enqueue(immediate.clone()).await.unwrap();

        assert_eq!(queue.try_claim(VISIBILITY).await.unwrap().unwrap().id(), immediate.id);
        assert!(queue.try_claim(VISIBILITY).await.unwrap().is_none());

        let depth = queue.depth().await.unwrap();
        assert_eq!(depth, QueueDepth { ready: 0, delayed: 1, leased: 1 });
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let queue = MemoryQueue::new();
        let env = envelope("dup");

        queue.enqueue(env.clone()).await.unwrap();
        assert!(matches!(queue.enqueue(env).await, Err(JobError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_ack_removes_envelope() {
        let queue = MemoryQueue::new();
        queue.enqueue(envelope("one")).await.unwrap();

        let lease = queue.try_claim(VISIBILITY).await.unwrap().unwrap();
        queue.ack(&lease).await.unwrap();

        assert!(queue.is_empty());
        assert!(matches!(queue.ack(&lease).await, Err(JobError::LeaseExpired(_))));
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let queue = MemoryQueue::new();
        let env = envelope("slow");
        queue.enqueue(env.clone()).await.unwrap();

        let first = queue.try_claim(Duration::from_millis(20)).await.unwrap().unwrap();
        assert!(queue.try_claim(VISIBILITY).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = queue.try_claim(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(second.id(), env.id);
        assert_ne!(second.token, first.token);
        assert!(second.envelope.visible_at >= env.visible_at);

        // The stale holder can no longer settle the envelope
        assert!(matches!(queue.ack(&first).await, Err(JobError::LeaseExpired(_))));
        queue.ack(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_delays_redelivery_and_keeps_attempt() {
        let queue = MemoryQueue::new();
        queue.enqueue(envelope("retry")).await.unwrap();

        let lease = queue.try_claim(VISIBILITY).await.unwrap().unwrap();
        let next = lease.envelope.next_attempt().unwrap();
        queue
            .nack(lease.with_envelope(next), Duration::from_millis(50))
            .await
            .unwrap();

        assert!(queue.try_claim(VISIBILITY).await.unwrap().is_none());
        let redelivered = queue
            .claim(VISIBILITY, Duration::from_secs(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(redelivered.envelope.attempt, 1);
    }

    #[tokio::test]
    async fn test_nack_rejects_attempt_regression() {
        let queue = MemoryQueue::new();
        queue.enqueue(envelope("retry")).await.unwrap();

        let lease = queue.try_claim(VISIBILITY).await.unwrap().unwrap();
        let bumped = lease.envelope.next_attempt().unwrap();
        queue.nack(lease.with_envelope(bumped), Duration::ZERO).await.unwrap();

        let lease = queue.try_claim(VISIBILITY).await.unwrap().unwrap();
        let mut regressed = lease.envelope.clone();
        regressed.attempt = 0;
        assert!(matches!(
            queue.nack(lease.with_envelope(regressed), Duration::ZERO).await,
            Err(JobError::InvalidEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn test_blocking_claim_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.claim(VISIBILITY, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let env = envelope("wake");
        queue.enqueue(env.clone()).await.unwrap();

        let lease = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(lease.id(), env.id);
    }

    #[tokio::test]
    async fn test_blocking_claim_times_out() {
        let queue = MemoryQueue::new();
        let started = std::time::Instant::now();

        let lease = queue.claim(VISIBILITY, Duration::from_millis(50)).await.unwrap();

        assert!(lease.is_none());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_share_an_envelope() {
        let queue = Arc::new(MemoryQueue::new());
        for i in 0..100 {
            queue.enqueue(envelope(&format!("job-{i}"))).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(lease) = queue.try_claim(VISIBILITY).await.unwrap() {
                    claimed.push(lease.id());
                }
                claimed
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(seen.insert(id), "envelope {id} leased twice");
            }
        }
        assert_eq!(seen.len(), 100);
    }

    #[tokio::test]
    async fn test_reap_expired() {
        let queue = MemoryQueue::new();
        queue.enqueue(envelope("a")).await.unwrap();
        queue.try_claim(Duration::from_millis(1)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.reap_expired().await.unwrap(), 1);
        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_reap_only_touches_expired_deadlines() {
        let queue = MemoryQueue::new();
        for name in ["short", "long", "acked"] {
            queue.enqueue(envelope(name)).await.unwrap();
        }
        let short = queue.try_claim(Duration::from_millis(1)).await.unwrap().unwrap();
        let long = queue.try_claim(VISIBILITY).await.unwrap().unwrap();
        let acked = queue.try_claim(Duration::from_millis(1)).await.unwrap().unwrap();
        queue.ack(&acked).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(queue.reap_expired().await.unwrap(), 1);
        assert_eq!(queue.reap_expired().await.unwrap(), 0);
        assert_eq!(
            queue.depth().await.unwrap(),
            QueueDepth { ready: 1, delayed: 0, leased: 1 }
        );
        assert!(matches!(queue.ack(&short).await, Err(JobError::LeaseExpired(_))));
        queue.ack(&long).await.unwrap();

        let again = queue.try_claim(VISIBILITY).await.unwrap().unwrap();
        assert_eq!(again.id(), short.id());
        queue.ack(&again).await.unwrap();
        assert!(queue.is_empty());
        assert!(queue.state.lock().leased.is_empty());
    }
}
