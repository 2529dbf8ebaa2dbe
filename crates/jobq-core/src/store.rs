//! Result store contract and the in-memory implementation.

use crate::{JobError, JobEvent, JobId, JobRecord, JobState, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info};

/// Maps job ids to their current record.
///
/// Every operation is atomic for a single record. Terminal records expire
/// after the store's TTL; lookups of an expired id fail with
/// [`JobError::Expired`] for one more TTL, then with [`JobError::NotFound`].
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Insert a new record; fails with `Duplicate` if the id is taken
    async fn create(&self, record: JobRecord) -> Result<()>;

    async fn get(&self, id: &JobId) -> Result<JobRecord>;

    /// Apply a lifecycle event atomically and return the updated record
    async fn apply(&self, id: &JobId, event: JobEvent) -> Result<JobRecord>;

    /// Drop a record outright (used to undo a failed submission)
    async fn remove(&self, id: &JobId) -> Result<()>;

    /// Unexpired records of `handler_name` stored in `state`, oldest first
    async fn list(&self, handler_name: &str, state: JobState) -> Result<Vec<JobRecord>>;

    /// Delete expired records; returns how many were removed
    async fn purge_expired(&self) -> Result<usize>;
}

pub struct MemoryResultStore {
    records: DashMap<JobId, JobRecord>,
    /// Expired ids, kept until the given instant
    tombstones: DashMap<JobId, DateTime<Utc>>,
    ttl: Duration,
}

impl MemoryResultStore {
    pub fn new(ttl: Duration) -> Self {
        MemoryResultStore {
            records: DashMap::new(),
            tombstones: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn expire(&self, id: &JobId, now: DateTime<Utc>) {
        if self.records.remove(id).is_some() {
            self.tombstones.insert(*id, now + self.ttl);
        }
    }

    fn missing(&self, id: &JobId, now: DateTime<Utc>) -> JobError {
        match self.tombstones.get(id) {
            Some(until) if *until > now => JobError::Expired(*id),
            _ => JobError::NotFound(*id),
        }
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn create(&self, record: JobRecord) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        let id = record.id;
        match self.records.entry(id) {
            Entry::Occupied(_) => Err(JobError::Duplicate(id)),
            Entry::Vacant(slot) => {
                slot.insert(record);
                self.tombstones.remove(&id);
                debug!(job_id = %id, "Created job record");
                Ok(())
            }
        }
    }

    async fn get(&self, id: &JobId) -> Result<JobRecord> {
        let now = Utc::now();

        let expired = match self.records.get(id) {
            Some(record) if !record.is_expired_at(now) => return Ok(record.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            self.expire(id, now);
        }
        Err(self.missing(id, now))
    }

    async fn apply(&self, id: &JobId, event: JobEvent) -> Result<JobRecord> {
        let now = Utc::now();

        let outcome = match self.records.get_mut(id) {
            Some(mut record) => {
                if record.is_expired_at(now) {
                    None
                } else {
                    record.apply(event, now, self.ttl)?;
                    Some(record.clone())
                }
            }
            None => return Err(self.missing(id, now)),
        };

        match outcome {
            Some(record) => Ok(record),
            None => {
                self.expire(id, now);
                Err(JobError::Expired(*id))
            }
        }
    }

    async fn remove(&self, id: &JobId) -> Result<()> {
        self.records.remove(id);
        Ok(())
    }

    async fn list(&self, handler_name: &str, state: JobState) -> Result<Vec<JobRecord>> {
        let now = Utc::now();
        let mut records: Vec<JobRecord> = self
            .records
            .iter()
            .filter(|entry| {
                let record = entry.value();
                record.handler_name == handler_name
                    && record.state == state
                    && !record.is_expired_at(now)
            })
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();

        let expired: Vec<JobId> = self
            .records
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| *entry.key())
            .collect();

        for id in &expired {
            self.expire(id, now);
        }
        self.tombstones.retain(|_, until| *until > now);

        if !expired.is_empty() {
            info!("Purged {} expired job records", expired.len());
        }
        Ok(expired.len())
    }
}
