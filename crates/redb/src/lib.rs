//! Storage backend for the kairos control plane on top of `redb`.
//!
//! One database file holds every scope: analyzer records, the action log,
//! observations, scratch scopes, upload metadata, admin requests, credential
//! grants, and the atomic counters. All writes happen inside single redb
//! write transactions, which is what the compare-and-swap transitions and
//! the fetch-and-add counters rest on.

use std::sync::Arc;

use redb::{Database, ReadTransaction, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};

use kairos_core::{IdFactory, StoreError};

mod actions;
mod analyzers;
mod grants;
mod metadata;
mod observations;
mod requests;
mod scratch;

pub type ValueTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

pub const ANALYZERS: ValueTable = TableDefinition::new("analyzers");
pub const ACTION_LOG: ValueTable = TableDefinition::new("action_log");
pub const OBSERVATIONS: ValueTable = TableDefinition::new("observations");
pub const SCRATCH_SCOPES: ValueTable = TableDefinition::new("scratch_scopes");
pub const SCRATCH_DOCS: ValueTable = TableDefinition::new("scratch_docs");
pub const METADATA: ValueTable = TableDefinition::new("metadata");
pub const REQUESTS: ValueTable = TableDefinition::new("requests");
pub const GRANTS: ValueTable = TableDefinition::new("grants");
pub const COUNTERS: ValueTable = TableDefinition::new("counters");

const ALL_TABLES: [ValueTable; 9] = [
    ANALYZERS,
    ACTION_LOG,
    OBSERVATIONS,
    SCRATCH_SCOPES,
    SCRATCH_DOCS,
    METADATA,
    REQUESTS,
    GRANTS,
    COUNTERS,
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    DatabaseError(#[from] ::redb::DatabaseError),

    #[error(transparent)]
    TransactionError(Box<::redb::TransactionError>),

    #[error(transparent)]
    CommitError(#[from] ::redb::CommitError),

    #[error(transparent)]
    TableError(#[from] ::redb::TableError),

    #[error(transparent)]
    StorageError(#[from] ::redb::StorageError),

    #[error("codec error: {0}")]
    CodecError(#[from] serde_json::Error),

    #[error("scope {0} already exists")]
    ScopeExists(String),
}

impl From<::redb::TransactionError> for Error {
    fn from(error: ::redb::TransactionError) -> Self {
        Error::TransactionError(Box::new(error))
    }
}

impl From<Error> for StoreError {
    fn from(error: Error) -> Self {
        match error {
            Error::CodecError(inner) => StoreError::corrupt(inner),
            other => StoreError::internal(other),
        }
    }
}

/// Composite key `scope 0x00 seq`, ordered by scope then sequence.
fn scoped_key(scope: &str, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(scope.len() + 9);
    key.extend_from_slice(scope.as_bytes());
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// The exclusive upper bound of all keys starting with `prefix`, or `None`
/// when the range is open-ended.
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, Error> {
    Ok(serde_json::to_vec(value)?)
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

impl Store {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        tracing::debug!(path = %path.as_ref().display(), "opening store");

        let db = Database::create(path)?;
        let store = Self { db: Arc::new(db) };
        store.initialize()?;
        Ok(store)
    }

    /// Ephemeral store, data lost on drop. Meant for tests and dry runs.
    pub fn in_memory() -> Result<Self, Error> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        let store = Self { db: Arc::new(db) };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), Error> {
        let wx = self.begin_write()?;
        for table in ALL_TABLES {
            let _ = wx.open_table(table)?;
        }
        wx.commit()?;
        Ok(())
    }

    fn begin_write(&self) -> Result<WriteTransaction, Error> {
        Ok(self.db.begin_write()?)
    }

    fn begin_read(&self) -> Result<ReadTransaction, Error> {
        Ok(self.db.begin_read()?)
    }

    /// Fetch-and-add on a named counter inside an existing transaction.
    fn next_id_in(wx: &WriteTransaction, counter: &str) -> Result<u64, Error> {
        let mut table = wx.open_table(COUNTERS)?;

        let current = table
            .get(counter.as_bytes())?
            .map(|v| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(v.value());
                u64::from_be_bytes(buf)
            })
            .unwrap_or(0);

        table.insert(counter.as_bytes(), (current + 1).to_be_bytes().as_slice())?;

        Ok(current)
    }
}

/// The counters this store serves. Asking for anything else is a
/// programming error, not a lazily-created counter.
const KNOWN_COUNTERS: [&str; 4] = ["action_id", "agent_id", "observation_id", "request_id"];

impl IdFactory for Store {
    fn next_id(&self, counter: &str) -> Result<u64, StoreError> {
        if !KNOWN_COUNTERS.contains(&counter) {
            return Err(StoreError::UnknownCounter(counter.to_string()));
        }

        let wx = self.begin_write()?;
        let id = Self::next_id_in(&wx, counter)?;
        wx.commit().map_err(Error::from)?;
        Ok(id)
    }
}
