//! # LedgerDb: Persistent Record Store
//!
//! sled-backed storage for ledger snapshots. The store knows nothing about
//! channels or proposals: it holds bincode-encoded records in named trees,
//! keyed by raw bytes, and the contracts crate decides what goes where.
//!
//! ## Tree Layout
//!
//! | Tree        | Key                         | Value                        |
//! |-------------|-----------------------------|------------------------------|
//! | `networks`  | asset address (32B)         | `bincode(PaymentNetwork)`    |
//! | `channels`  | channel id (32B)            | `bincode(Channel)`           |
//! | `proposals` | kind byte ‖ subject id      | `bincode(proposal record)`   |
//! | `delegates` | user address (32B)          | `bincode(Vec<Delegate>)`     |
//! | `disputes`  | channel id (32B)            | `bincode(ClosingRecord)`     |
//! | `metadata`  | key (UTF-8)                 | value (bytes)                |
//!
//! ## Atomicity
//!
//! [`LedgerDb::replace_tree`] swaps the full content of one tree in a single
//! sled `Batch`: stale keys are removed and fresh ones inserted together.

use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Batch, Db, Tree};
use std::path::Path;

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

/// Errors that can occur during database operations.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// The record kinds a ledger snapshot is split into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Table {
    Networks,
    Channels,
    Proposals,
    Delegates,
    Disputes,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Table::Networks => "networks",
            Table::Channels => "channels",
            Table::Proposals => "proposals",
            Table::Delegates => "delegates",
            Table::Disputes => "disputes",
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerDb
// ---------------------------------------------------------------------------

/// Persistent storage for ledger records.
///
/// Cheap to clone; all clones share the same sled instance.
#[derive(Debug, Clone)]
pub struct LedgerDb {
    db: Db,
    networks: Tree,
    channels: Tree,
    proposals: Tree,
    delegates: Tree,
    disputes: Tree,
    metadata: Tree,
}

impl LedgerDb {
    /// Open or create a database at the given filesystem path.
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// In-memory database, removed on drop. For tests.
    pub fn open_temporary() -> DbResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> DbResult<Self> {
        Ok(Self {
            networks: db.open_tree(Table::Networks.name())?,
            channels: db.open_tree(Table::Channels.name())?,
            proposals: db.open_tree(Table::Proposals.name())?,
            delegates: db.open_tree(Table::Delegates.name())?,
            disputes: db.open_tree(Table::Disputes.name())?,
            metadata: db.open_tree("metadata")?,
            db,
        })
    }

    fn tree(&self, table: Table) -> &Tree {
        match table {
            Table::Networks => &self.networks,
            Table::Channels => &self.channels,
            Table::Proposals => &self.proposals,
            Table::Delegates => &self.delegates,
            Table::Disputes => &self.disputes,
        }
    }

    // -- Record operations --------------------------------------------------

    /// Insert or overwrite one record.
    pub fn put<T: Serialize>(&self, table: Table, key: &[u8], record: &T) -> DbResult<()> {
        let bytes = encode(record)?;
        self.tree(table).insert(key, bytes)?;
        Ok(())
    }

    /// Fetch one record, `None` if absent.
    pub fn get<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> DbResult<Option<T>> {
        match self.tree(table).get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All records of a table in key order.
    pub fn scan<T: DeserializeOwned>(&self, table: Table) -> DbResult<Vec<(Vec<u8>, T)>> {
        let mut out = Vec::new();
        for entry in self.tree(table).iter() {
            let (key, value) = entry?;
            out.push((key.to_vec(), decode(&value)?));
        }
        Ok(out)
    }

    /// Replace the whole content of a table atomically.
    pub fn replace_tree<T: Serialize>(&self, table: Table, records: &[(Vec<u8>, T)]) -> DbResult<()> {
        let tree = self.tree(table);
        let mut batch = Batch::default();
        for key in tree.iter().keys() {
            batch.remove(key?);
        }
        for (key, record) in records {
            batch.insert(key.as_slice(), encode(record)?);
        }
        tree.apply_batch(batch)?;
        Ok(())
    }

    /// Number of records in a table.
    pub fn len(&self, table: Table) -> usize {
        self.tree(table).len()
    }

    // -- Metadata operations ------------------------------------------------

    pub fn put_meta_u64(&self, key: &str, value: u64) -> DbResult<()> {
        self.metadata.insert(key.as_bytes(), &value.to_be_bytes())?;
        Ok(())
    }

    pub fn get_meta_u64(&self, key: &str) -> DbResult<Option<u64>> {
        match self.metadata.get(key.as_bytes())? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| DbError::Serialization(format!("invalid u64 under {key}")))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> DbResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn encode<T: Serialize>(record: &T) -> DbResult<Vec<u8>> {
    bincode::serialize(record).map_err(|e| DbError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    bincode::deserialize(bytes).map_err(|e| DbError::Serialization(e.to_string()))
}
