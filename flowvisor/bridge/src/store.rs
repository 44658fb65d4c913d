//! Persistence backends for the consistency mirror.
//!
//! The store holds one persisted record per FlowSpace entry. It is written by
//! the mirror before the mirror's in-memory copy changes, and read once at
//! startup to rebuild both the flow map and the mirror.

use crate::config::{StorageBackend, StorageConfig};
use flowspace::{EntryId, FlowSpaceError, FlowSpaceRecord};
use log::warn;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, ErrorCode};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by a [`FlowSpaceStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid stored record: {0}")]
    Record(#[from] FlowSpaceError),

    /// Insert collided with an existing id or name
    #[error("duplicate flowspace entry: {0}")]
    Duplicate(String),
}

/// Durable home of the persisted FlowSpace records.
pub trait FlowSpaceStore: Send + Sync {
    /// Every stored record, priority descending then id ascending.
    fn load(&self) -> Result<Vec<FlowSpaceRecord>, StoreError>;

    /// Stores a new record. Fails with `Duplicate` when its id or name is
    /// already present.
    fn insert(&self, record: &FlowSpaceRecord) -> Result<(), StoreError>;

    /// Deletes the record with `id`; returns whether one existed.
    fn delete(&self, id: EntryId) -> Result<bool, StoreError>;
}

/// Opens the backend named by `config`.
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn FlowSpaceStore>, StoreError> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.path)?)),
    }
}

fn sort_records(records: &mut [FlowSpaceRecord]) {
    records.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
}

// ================================================================================================
// IN-MEMORY STORE
// ================================================================================================

/// Volatile store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<EntryId, FlowSpaceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `records`.
    pub fn with_records<I>(records: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = FlowSpaceRecord>,
    {
        let store = MemoryStore::new();
        for record in records {
            store.insert(&record)?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl FlowSpaceStore for MemoryStore {
    fn load(&self) -> Result<Vec<FlowSpaceRecord>, StoreError> {
        let mut records: Vec<FlowSpaceRecord> = self.records.read().values().cloned().collect();
        sort_records(&mut records);
        Ok(records)
    }

    fn insert(&self, record: &FlowSpaceRecord) -> Result<(), StoreError> {
        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(StoreError::Duplicate(format!("id={}", record.id)));
        }
        if records.values().any(|r| r.name == record.name) {
            return Err(StoreError::Duplicate(format!("name={}", record.name)));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn delete(&self, id: EntryId) -> Result<bool, StoreError> {
        Ok(self.records.write().remove(&id).is_some())
    }
}

// ================================================================================================
// SQLITE STORE
// ================================================================================================

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS flowspace (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    priority    INTEGER NOT NULL DEFAULT 0,
    record_json TEXT NOT NULL,
    updated_at  REAL NOT NULL
);
";

/// SQLite-backed store; one row per entry.
#[derive(Debug)]
pub struct SqliteStore {
    db: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore {
            db: Mutex::new(conn),
        })
    }
}

impl FlowSpaceStore for SqliteStore {
    fn load(&self) -> Result<Vec<FlowSpaceRecord>, StoreError> {
        // Collect rows before parsing so the connection lock is not held
        // while records are decoded.
        let rows: Vec<(i64, String)> = {
            let conn = self.db.lock();
            let mut stmt = conn.prepare("SELECT id, record_json FROM flowspace")?;
            let collected = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            collected
        };

        let mut records = Vec::with_capacity(rows.len());
        for (id, record_json) in rows {
            match serde_json::from_str::<FlowSpaceRecord>(&record_json) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping stored flowspace entry {} with invalid record: {}", id, e),
            }
        }
        sort_records(&mut records);
        Ok(records)
    }

    fn insert(&self, record: &FlowSpaceRecord) -> Result<(), StoreError> {
        let record_json = serde_json::to_string(record)?;
        let id = i64::try_from(record.id)
            .map_err(|_| StoreError::Duplicate(format!("id={} is out of range", record.id)))?;
        let updated_at = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;

        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO flowspace (id, name, priority, record_json, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, record.name, i64::from(record.priority), record_json, updated_at],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(ref failure, _)
                if failure.code == ErrorCode::ConstraintViolation =>
            {
                StoreError::Duplicate(format!("id={} name={}", record.id, record.name))
            }
            other => StoreError::Sqlite(other),
        })?;
        Ok(())
    }

    fn delete(&self, id: EntryId) -> Result<bool, StoreError> {
        let Ok(id) = i64::try_from(id) else {
            return Ok(false);
        };
        let conn = self.db.lock();
        let deleted = conn.execute("DELETE FROM flowspace WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }
}
