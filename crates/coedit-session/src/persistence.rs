//! Snapshot persistence.
//!
//! A session hands encoded document snapshots to a [`SnapshotStore`]; a
//! workspace loads them back when a document is opened.

use chrono::{DateTime, Utc};
use coedit_core::{DocId, Version};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Durable storage for document snapshots and named versions.
pub trait SnapshotStore: Send + Sync {
    /// Latest snapshot of a document, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read.
    fn load_snapshot(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, PersistenceError>;

    /// Replace the snapshot of a document.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written.
    fn save_snapshot(&self, doc_id: &DocId, snapshot: &[u8]) -> Result<(), PersistenceError>;

    /// Store a named version.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be written.
    fn save_version(&self, doc_id: &DocId, version: &Version) -> Result<(), PersistenceError>;

    /// All stored versions of a document, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be read.
    fn load_versions(&self, doc_id: &DocId) -> Result<Vec<Version>, PersistenceError>;
}

/// In-process store, used by tests and the `memory` store type.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: Mutex<HashMap<DocId, Vec<u8>>>,
    versions: Mutex<HashMap<DocId, Vec<Version>>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl SnapshotStore for MemoryStore {
    fn load_snapshot(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(lock(&self.snapshots).get(doc_id).cloned())
    }

    fn save_snapshot(&self, doc_id: &DocId, snapshot: &[u8]) -> Result<(), PersistenceError> {
        lock(&self.snapshots).insert(doc_id.clone(), snapshot.to_vec());
        Ok(())
    }

    fn save_version(&self, doc_id: &DocId, version: &Version) -> Result<(), PersistenceError> {
        let mut versions = lock(&self.versions);
        let list = versions.entry(doc_id.clone()).or_default();
        list.retain(|v| v.number != version.number);
        list.push(version.clone());
        list.sort_by_key(|v| v.number);
        Ok(())
    }

    fn load_versions(&self, doc_id: &DocId) -> Result<Vec<Version>, PersistenceError> {
        Ok(lock(&self.versions).get(doc_id).cloned().unwrap_or_default())
    }
}

/// `SQLite`-backed persistence store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        Self::init(Connection::open(path)?)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, PersistenceError> {
        conn.execute_batch(
            r"
            -- Latest snapshot for each document
            CREATE TABLE IF NOT EXISTS doc_snapshots (
                doc_id TEXT PRIMARY KEY,
                snapshot_bytes BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Named versions
            CREATE TABLE IF NOT EXISTS doc_versions (
                doc_id TEXT NOT NULL,
                number INTEGER NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL,
                snapshot_bytes BLOB NOT NULL,
                PRIMARY KEY (doc_id, number)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl SnapshotStore for SqliteStore {
    fn load_snapshot(&self, doc_id: &DocId) -> Result<Option<Vec<u8>>, PersistenceError> {
        let conn = lock(&self.conn);
        let snapshot = conn
            .query_row(
                "SELECT snapshot_bytes FROM doc_snapshots WHERE doc_id = ?1",
                [doc_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(snapshot)
    }

    fn save_snapshot(&self, doc_id: &DocId, snapshot: &[u8]) -> Result<(), PersistenceError> {
        let conn = lock(&self.conn);
        conn.execute(
            r"
            INSERT OR REPLACE INTO doc_snapshots (doc_id, snapshot_bytes, updated_at)
            VALUES (?1, ?2, ?3)
            ",
            (doc_id.as_str(), snapshot, Utc::now().timestamp_millis()),
        )?;
        tracing::debug!(doc_id = %doc_id, bytes = snapshot.len(), "Saved snapshot");
        Ok(())
    }

    fn save_version(&self, doc_id: &DocId, version: &Version) -> Result<(), PersistenceError> {
        let conn = lock(&self.conn);
        conn.execute(
            r"
            INSERT OR REPLACE INTO doc_versions
                (doc_id, number, name, description, created_at, snapshot_bytes)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            (
                doc_id.as_str(),
                version.number,
                &version.name,
                &version.description,
                version.created_at.timestamp_millis(),
                &version.snapshot,
            ),
        )?;
        Ok(())
    }

    fn load_versions(&self, doc_id: &DocId) -> Result<Vec<Version>, PersistenceError> {
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare(
            r"
            SELECT number, name, description, created_at, snapshot_bytes FROM doc_versions
            WHERE doc_id = ?1
            ORDER BY number ASC
            ",
        )?;

        let rows = stmt
            .query_map([doc_id.as_str()], |row| {
                Ok((
                    row.get::<_, u32>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(number, name, description, millis, snapshot)| {
                let created_at = DateTime::<Utc>::from_timestamp_millis(millis)
                    .ok_or(PersistenceError::InvalidTimestamp(millis))?;
                Ok(Version {
                    number,
                    name,
                    description,
                    created_at,
                    snapshot,
                })
            })
            .collect()
    }
}

/// Errors for persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// `SQLite` failure
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A stored timestamp is out of range
    #[error("invalid stored timestamp {0}")]
    InvalidTimestamp(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(number: u32, name: &str) -> Version {
        Version {
            number,
            name: name.to_string(),
            description: Some("first draft".to_string()),
            created_at: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap(),
            snapshot: vec![1, 0],
        }
    }

    fn exercise(store: &dyn SnapshotStore) {
        let doc = DocId::new("doc1");
        assert_eq!(store.load_snapshot(&doc).unwrap(), None);

        store.save_snapshot(&doc, b"one").unwrap();
        store.save_snapshot(&doc, b"two").unwrap();
        assert_eq!(store.load_snapshot(&doc).unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(store.load_snapshot(&DocId::new("other")).unwrap(), None);

        store.save_version(&doc, &version(2, "second")).unwrap();
        store.save_version(&doc, &version(1, "first")).unwrap();
        let versions = store.load_versions(&doc).unwrap();
        assert_eq!(versions, vec![version(1, "first"), version(2, "second")]);
    }

    #[test]
    fn memory_store_basic_operations() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn sqlite_store_basic_operations() {
        exercise(&SqliteStore::in_memory().unwrap());
    }
}
