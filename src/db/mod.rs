//! Task status store: image task records, album archive records, faces,
//! embeddings and people, all in one SQLite database.
//!
//! Every method takes the connection lock for the duration of one statement
//! (or one transaction), which gives the per-row atomicity the workers rely
//! on. Face reconciliation and person deletion are the only multi-row
//! writes; both run inside a transaction.

mod schema;
pub mod albums;
pub mod embeddings;
pub mod faces;
pub mod images;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;

pub use schema::SCHEMA;
pub use albums::AlbumZipRecord;
pub use embeddings::{cosine_similarity, EmbeddingScope, FaceEmbedding, StoredEmbedding};
pub use faces::{BoundingBox, DetectedFace, Face, Person};
pub use images::{ImageTaskRecord, TaskState};

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a database file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        self.conn().execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Exclusive access to the connection. A panic in another holder does
    /// not invalidate the connection, so poisoning is ignored.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Timestamp format used for every `*_at` column.
pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    db
}
