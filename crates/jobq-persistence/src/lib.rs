mod queue;
mod store;

pub use queue::DurableQueue;
pub use store::RocksResultStore;

use jobq_core::JobError;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Column family names
pub(crate) const CF_ENVELOPES: &str = "envelopes";
pub(crate) const CF_RECORDS: &str = "records";
pub(crate) const CF_TOMBSTONES: &str = "tombstones";

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("RocksDB error: {0}")]
    RocksDbError(#[from] rocksdb::Error),

    #[error("Job error: {0}")]
    JobError(#[from] JobError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Column family not found: {0}")]
    MissingColumnFamily(&'static str),

    #[error("Corrupt entry: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

impl PersistenceError {
    /// Map to the engine taxonomy, reporting backend faults as a broker outage
    pub(crate) fn into_broker_error(self) -> JobError {
        match self {
            PersistenceError::JobError(e) => e,
            other => JobError::BrokerUnavailable(other.to_string()),
        }
    }

    /// Map to the engine taxonomy, reporting backend faults as storage errors
    pub(crate) fn into_store_error(self) -> JobError {
        match self {
            PersistenceError::JobError(e) => e,
            other => JobError::Storage(other.to_string()),
        }
    }
}

/// Open (or create) the RocksDB database holding queue and result data
pub fn open_database(data_dir: impl AsRef<Path>) -> Result<Arc<DB>> {
    let data_dir = data_dir.as_ref();
    std::fs::create_dir_all(data_dir)?;

    let mut db_opts = Options::default();
    db_opts.create_if_missing(true);
    db_opts.create_missing_column_families(true);

    let cf_descriptors = vec![
        ColumnFamilyDescriptor::new(CF_ENVELOPES, Options::default()),
        ColumnFamilyDescriptor::new(CF_RECORDS, Options::default()),
        ColumnFamilyDescriptor::new(CF_TOMBSTONES, Options::default()),
    ];

    let db = DB::open_cf_descriptors(&db_opts, data_dir.join("jobs"), cf_descriptors)?;
    info!("Opened job database at {:?}", data_dir);

    Ok(Arc::new(db))
}

pub(crate) fn cf<'a>(db: &'a DB, name: &'static str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or(PersistenceError::MissingColumnFamily(name))
}
