//! Caravel store: transactional persistence under the registry.
//!
//! A single-file redb database. One table ("bucket") per managed kind plus a
//! reserved `_metadata` table holding the store-wide resourceVersion counter.
//! The counter is an 8-byte big-endian integer so byte order equals numeric
//! order. Write transactions are serialized by redb; reads run on MVCC
//! snapshots and never block writers.

#![forbid(unsafe_code)]

use std::path::Path;

use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};

/// Reserved bucket for store-level metadata.
pub const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("_metadata");
/// Service objects keyed by `"<namespace>/<name>"`, JSON values.
pub const SERVICES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

const GLOBAL_RV_KEY: &str = "globalResourceVersion";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Corrupt(String),
}

impl From<StoreError> for caravel_core::Error {
    fn from(e: StoreError) -> Self {
        caravel_core::Error::Internal(e.to_string())
    }
}

pub struct Store {
    db: Database,
}

impl Store {
    /// Opens (or creates) the database file and ensures the metadata bucket
    /// exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        txn.open_table(METADATA_TABLE)?;
        txn.commit()?;
        Ok(Self { db })
    }

    /// Runs `f` against a read-only snapshot. Views may run concurrently with
    /// each other and with a writer.
    pub fn view<T, E>(&self, f: impl FnOnce(&ReadTransaction) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_read().map_err(StoreError::from)?;
        f(&txn)
    }

    /// Runs `f` against the write transaction and commits iff it returned Ok.
    /// Writers are fully serialized.
    pub fn update<T, E>(&self, f: impl FnOnce(&WriteTransaction) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let txn = self.db.begin_write().map_err(StoreError::from)?;
        match f(&txn) {
            Ok(v) => {
                txn.commit().map_err(StoreError::from)?;
                Ok(v)
            }
            Err(e) => {
                let _ = txn.abort();
                Err(e)
            }
        }
    }

    /// Ensures a kind bucket exists. Called once per kind at registry setup.
    pub fn ensure_bucket(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> Result<(), StoreError> {
        self.update(|txn| {
            txn.open_table(table)?;
            Ok(())
        })
    }
}

/// Atomically increments the global resourceVersion counter within `txn` and
/// returns the new value. The bump commits together with the caller's writes.
pub fn next_resource_version(txn: &WriteTransaction) -> Result<u64, StoreError> {
    let mut table = txn.open_table(METADATA_TABLE)?;
    let current = match table.get(GLOBAL_RV_KEY)? {
        Some(guard) => decode_rv(guard.value())?,
        None => 0,
    };
    let next = current + 1;
    table.insert(GLOBAL_RV_KEY, encode_rv(next).as_slice())?;
    Ok(next)
}

/// Reads the counter from a snapshot; 0 before the first mutation.
pub fn current_resource_version(txn: &ReadTransaction) -> Result<u64, StoreError> {
    let table = txn.open_table(METADATA_TABLE)?;
    match table.get(GLOBAL_RV_KEY)? {
        Some(guard) => decode_rv(guard.value()),
        None => Ok(0),
    }
}

/// Collects all `(key, value)` pairs whose key starts with `prefix`, in byte
/// order. An empty prefix scans the whole bucket.
pub fn scan_prefix(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    prefix: &str,
) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
    let mut out = Vec::new();
    for item in table.range(prefix..)? {
        let (k, v) = item?;
        if !k.value().starts_with(prefix) {
            break;
        }
        out.push((k.value().to_string(), v.value().to_vec()));
    }
    Ok(out)
}

fn encode_rv(rv: u64) -> [u8; 8] {
    rv.to_be_bytes()
}

fn decode_rv(bytes: &[u8]) -> Result<u64, StoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("counter is {} bytes, want 8", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}
