use crate::{cf, PersistenceError, Result, CF_RECORDS, CF_TOMBSTONES};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use jobq_core::{JobError, JobEvent, JobId, JobRecord, JobState, ResultStore};
use parking_lot::Mutex;
use rocksdb::{WriteBatch, DB};
use std::sync::Arc;
use tracing::{debug, info};

/// RocksDB-backed result store.
///
/// Records are JSON values keyed by job id. Expired ids leave a tombstone
/// holding the instant (millis, big-endian) until which lookups report
/// `Expired`.
pub struct RocksResultStore {
    db: Arc<DB>,
    ttl: Duration,
    /// Serializes read-modify-write cycles on records
    write_lock: Mutex<()>,
}

impl RocksResultStore {
    pub fn new(db: Arc<DB>, ttl: Duration) -> Self {
        RocksResultStore {
            db,
            ttl,
            write_lock: Mutex::new(()),
        }
    }

    fn load(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let cf = cf(&self.db, CF_RECORDS)?;
        match self.db.get_pinned_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, record: &JobRecord) -> Result<()> {
        let cf = cf(&self.db, CF_RECORDS)?;
        self.db
            .put_cf(cf, record.id.as_bytes(), serde_json::to_vec(record)?)?;
        Ok(())
    }

    /// Replace a record with its tombstone in one batch
    fn expire(&self, id: &JobId, now: DateTime<Utc>) -> Result<()> {
        let records = cf(&self.db, CF_RECORDS)?;
        let tombstones = cf(&self.db, CF_TOMBSTONES)?;

        let until = now + self.ttl;
        let mut batch = WriteBatch::default();
        batch.delete_cf(records, id.as_bytes());
        batch.put_cf(tombstones, id.as_bytes(), until.timestamp_millis().to_be_bytes());
        self.db.write(batch)?;

        debug!(job_id = %id, "Expired job record");
        Ok(())
    }

    fn tombstone(&self, id: &JobId) -> Result<Option<DateTime<Utc>>> {
        let cf = cf(&self.db, CF_TOMBSTONES)?;
        match self.db.get_pinned_cf(cf, id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_instant(&bytes)?)),
            None => Ok(None),
        }
    }

    fn missing(&self, id: &JobId, now: DateTime<Utc>) -> Result<JobError> {
        Ok(match self.tombstone(id)? {
            Some(until) if until > now => JobError::Expired(*id),
            _ => JobError::NotFound(*id),
        })
    }

    fn get_inner(&self, id: &JobId) -> Result<JobRecord> {
        let now = Utc::now();
        match self.load(id)? {
            Some(record) if !record.is_expired_at(now) => Ok(record),
            Some(_) => {
                let _guard = self.write_lock.lock();
                self.expire(id, now)?;
                Err(JobError::Expired(*id).into())
            }
            None => Err(self.missing(id, now)?.into()),
        }
    }

    fn create_inner(&self, record: JobRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        let id = record.id;

        if self.load(&id)?.is_some() {
            return Err(JobError::Duplicate(id).into());
        }

        let records = cf(&self.db, CF_RECORDS)?;
        let tombstones = cf(&self.db, CF_TOMBSTONES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(records, id.as_bytes(), serde_json::to_vec(&record)?);
        batch.delete_cf(tombstones, id.as_bytes());
        self.db.write(batch)?;

        debug!(job_id = %id, "Created job record");
        Ok(())
    }

    fn apply_inner(&self, id: &JobId, event: JobEvent) -> Result<JobRecord> {
        let _guard = self.write_lock.lock();
        let now = Utc::now();

        let mut record = match self.load(id)? {
            Some(record) => record,
            None => return Err(self.missing(id, now)?.into()),
        };

        if record.is_expired_at(now) {
            self.expire(id, now)?;
            return Err(JobError::Expired(*id).into());
        }

        record.apply(event, now, self.ttl)?;
        self.save(&record)?;
        Ok(record)
    }

    fn remove_inner(&self, id: &JobId) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = cf(&self.db, CF_RECORDS)?;
        self.db.delete_cf(cf, id.as_bytes())?;
        Ok(())
    }

    fn list_inner(&self, handler_name: &str, state: JobState) -> Result<Vec<JobRecord>> {
        let now = Utc::now();
        let records = cf(&self.db, CF_RECORDS)?;

        let mut matching = Vec::new();
        for item in self.db.iterator_cf(records, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            let record: JobRecord = serde_json::from_slice(&value)?;
            if record.handler_name == handler_name
                && record.state == state
                && !record.is_expired_at(now)
            {
                matching.push(record);
            }
        }

        matching.sort_by_key(|record| record.created_at);
        Ok(matching)
    }

    fn purge_inner(&self) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let now = Utc::now();

        let records = cf(&self.db, CF_RECORDS)?;
        let mut expired = Vec::new();
        for item in self.db.iterator_cf(records, rocksdb::IteratorMode::Start) {
            let (_key, value) = item?;
            let record: JobRecord = serde_json::from_slice(&value)?;
            if record.is_expired_at(now) {
                expired.push(record.id);
            }
        }

        for id in &expired {
            self.expire(id, now)?;
        }

        let tombstones = cf(&self.db, CF_TOMBSTONES)?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(tombstones, rocksdb::IteratorMode::Start) {
            let (key, value) = item?;
            if decode_instant(&value)? <= now {
                batch.delete_cf(tombstones, key);
            }
        }
        self.db.write(batch)?;

        if !expired.is_empty() {
            info!("Purged {} expired job records", expired.len());
        }
        Ok(expired.len())
    }
}

fn decode_instant(bytes: &[u8]) -> Result<DateTime<Utc>> {
    let millis: [u8; 8] = bytes
        .try_into()
        .map_err(|_| PersistenceError::Corrupt(format!("tombstone of {} bytes", bytes.len())))?;
    Utc.timestamp_millis_opt(i64::from_be_bytes(millis))
        .single()
        .ok_or_else(|| PersistenceError::Corrupt("tombstone out of range".to_string()))
}

#[async_trait]
impl ResultStore for RocksResultStore {
    async fn create(&self, record: JobRecord) -> jobq_core::Result<()> {
        self.create_inner(record)
            .map_err(PersistenceError::into_store_error)
    }

    async fn get(&self, id: &JobId) -> jobq_core::Result<JobRecord> {
        self.get_inner(id).map_err(PersistenceError::into_store_error)
    }

    async fn apply(&self, id: &JobId, event: JobEvent) -> jobq_core::Result<JobRecord> {
        self.apply_inner(id, event)
            .map_err(PersistenceError::into_store_error)
    }

    async fn remove(&self, id: &JobId) -> jobq_core::Result<()> {
        self.remove_inner(id).map_err(PersistenceError::into_store_error)
    }

    async fn list(&self, handler_name: &str, state: JobState) -> jobq_core::Result<Vec<JobRecord>> {
        self.list_inner(handler_name, state)
            .map_err(PersistenceError::into_store_error)
    }

    async fn purge_expired(&self) -> jobq_core::Result<usize> {
        self.purge_inner().map_err(PersistenceError::into_store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::open_database;
    use jobq_core::{JobEnvelope, LeaseToken};
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn new_record() -> JobRecord {
        let envelope = JobEnvelope::new("weather", json!({"cities": ["Oslo"]}), 3).unwrap();
        JobRecord::pending(&envelope)
    }

    #[tokio::test]
    async fn test_create_get_apply() {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksResultStore::new(open_database(temp_dir.path()).unwrap(), Duration::hours(1));
        let record = new_record();
        let id = record.id;
        let lease = LeaseToken::new();

        store.create(record.clone()).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), record);
        assert!(matches!(store.create(record).await, Err(JobError::Duplicate(_))));

        store.apply(&id, JobEvent::Started { lease }).await.unwrap();
        let done = store
            .apply(&id, JobEvent::Succeeded { lease, result: json!({"ok": true}) })
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Succeeded);
        assert!(matches!(
            store.apply(&id, JobEvent::Started { lease }).await,
            Err(JobError::TerminalState(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_record_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksResultStore::new(open_database(temp_dir.path()).unwrap(), Duration::hours(1));
        let record = new_record();
        let id = record.id;
        store.create(record.clone()).await.unwrap();

        let event = JobEvent::Succeeded {
            lease: LeaseToken::new(),
            result: json!(1),
        };
        assert!(matches!(
            store.apply(&id, event).await,
            Err(JobError::InvalidTransition { .. })
        ));
        assert_eq!(store.get(&id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let record = new_record();
        let id = record.id;
        let lease = LeaseToken::new();

        {
            let store =
                RocksResultStore::new(open_database(temp_dir.path()).unwrap(), Duration::hours(1));
            store.create(record).await.unwrap();
            store.apply(&id, JobEvent::Started { lease }).await.unwrap();
        }

        let store = RocksResultStore::new(open_database(temp_dir.path()).unwrap(), Duration::hours(1));
        let fetched = store.get(&id).await.unwrap();
        assert_eq!(fetched.state, JobState::Running);
        assert_eq!(fetched.runs, 1);
        assert_eq!(fetched.lease, Some(lease));
    }

    #[tokio::test]
    async fn test_list_succeeded_records() {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksResultStore::new(open_database(temp_dir.path()).unwrap(), Duration::hours(1));
        let lease = LeaseToken::new();

        let done = new_record();
        store.create(done.clone()).await.unwrap();
        store.apply(&done.id, JobEvent::Started { lease }).await.unwrap();
        store
            .apply(&done.id, JobEvent::Succeeded { lease, result: json!({"cities": []}) })
            .await
            .unwrap();
        store.create(new_record()).await.unwrap();

        let listed = store.list("weather", JobState::Succeeded).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, done.id);
        assert_eq!(store.list("weather", JobState::Pending).await.unwrap().len(), 1);
        assert!(store.list("geocode", JobState::Pending).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_then_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksResultStore::new(
            open_database(temp_dir.path()).unwrap(),
            Duration::milliseconds(50),
        );
        let record = new_record();
        let id = record.id;
        let lease = LeaseToken::new();
        store.create(record).await.unwrap();
        store.apply(&id, JobEvent::Started { lease }).await.unwrap();
        store
            .apply(&id, JobEvent::Failed { lease, attempt: 0, error: "no such city".into() })
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(matches!(store.get(&id).await, Err(JobError::Expired(_))));

        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 0);
        assert!(matches!(store.get(&id).await, Err(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksResultStore::new(open_database(temp_dir.path()).unwrap(), Duration::hours(1));
        assert!(matches!(
            store.get(&Uuid::new_v4()).await,
            Err(JobError::NotFound(_))
        ));
        let started = JobEvent::Started { lease: LeaseToken::new() };
        assert!(matches!(
            store.apply(&Uuid::new_v4(), started).await,
            Err(JobError::NotFound(_))
        ));
    }
}
