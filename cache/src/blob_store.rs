use crate::CacheError;
use rusqlite::{params, Connection, OptionalExtension};
use rusqlite_migration::{Migrations, M};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Durable key → bytes storage that survives process restarts.
pub trait DurableKeyValueStore: Send + Sync {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    /// Replaces any previous value for `key` as a whole.
    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError>;
    fn delete_blob(&self, key: &str) -> Result<(), CacheError>;
}

fn apply_migrations(conn: &mut Connection) -> Result<(), CacheError> {
    let migrations = Migrations::new(vec![
        M::up(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);\
             INSERT INTO schema_version (version) VALUES (1);\
             CREATE TABLE IF NOT EXISTS blobs (\
                 key TEXT PRIMARY KEY,\
                 value BLOB NOT NULL\
             );",
        ),
        M::up(
            "ALTER TABLE blobs ADD COLUMN updated_at INTEGER NOT NULL DEFAULT 0;\
             UPDATE schema_version SET version = 2;",
        ),
    ]);
    migrations
        .to_latest(conn)
        .map_err(|e| CacheError::DatabaseError(format!("Failed to apply migrations: {}", e)))?;
    Ok(())
}

/// SQLite-backed blob store. Each write is a single `INSERT OR REPLACE`, so a
/// reader sees either the old or the new value, never a mix.
#[derive(Clone)]
pub struct SqliteBlobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBlobStore {
    pub fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut conn = Connection::open(db_path)
            .map_err(|e| CacheError::DatabaseError(format!("Failed to open database: {}", e)))?;
        apply_migrations(&mut conn)?;
        Ok(SqliteBlobStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, CacheError> {
        self.conn
            .lock()
            .map_err(|_| CacheError::Other("Poisoned lock".into()))
    }

    pub fn keys(&self) -> Result<Vec<String>, CacheError> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT key FROM blobs ORDER BY key")
            .map_err(|e| CacheError::DatabaseError(format!("Failed to prepare statement: {}", e)))?;
        let iter = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| CacheError::DatabaseError(format!("Failed to query keys: {}", e)))?;
        let mut keys = Vec::new();
        for key in iter {
            keys.push(key.map_err(|e| CacheError::DatabaseError(e.to_string()))?);
        }
        Ok(keys)
    }

    pub fn clear(&self) -> Result<(), CacheError> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM blobs", [])
            .map_err(|e| CacheError::DatabaseError(format!("Failed to clear blobs: {}", e)))?;
        Ok(())
    }

    pub async fn read_blob_async(&self, key: String) -> Result<Option<Vec<u8>>, CacheError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.read_blob(&key))
            .await
            .map_err(|e| CacheError::Other(e.to_string()))?
    }

    pub async fn write_blob_async(&self, key: String, bytes: Vec<u8>) -> Result<(), CacheError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.write_blob(&key, &bytes))
            .await
            .map_err(|e| CacheError::Other(e.to_string()))?
    }
}

impl DurableKeyValueStore for SqliteBlobStore {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let conn = self.lock_conn()?;
        conn.query_row(
            "SELECT value FROM blobs WHERE key = ?1",
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()
        .map_err(|e| CacheError::DatabaseError(format!("Failed to read blob: {}", e)))
    }

    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO blobs (key, value, updated_at) VALUES (?1, ?2, strftime('%s', 'now'))",
            params![key, bytes],
        )
        .map_err(|e| CacheError::DatabaseError(format!("Failed to write blob: {}", e)))?;
        Ok(())
    }

    fn delete_blob(&self, key: &str) -> Result<(), CacheError> {
        let conn = self.lock_conn()?;
        conn.execute("DELETE FROM blobs WHERE key = ?1", params![key])
            .map_err(|e| CacheError::DatabaseError(format!("Failed to delete blob: {}", e)))?;
        Ok(())
    }
}

/// Volatile store for tests and for running without a cache directory.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    writes: Mutex<u64>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `write_blob` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }
}

impl DurableKeyValueStore for MemoryBlobStore {
    fn read_blob(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| CacheError::Other("Poisoned lock".into()))?;
        Ok(blobs.get(key).cloned())
    }

    fn write_blob(&self, key: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| CacheError::Other("Poisoned lock".into()))?;
        blobs.insert(key.to_string(), bytes.to_vec());
        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }

    fn delete_blob(&self, key: &str) -> Result<(), CacheError> {
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| CacheError::Other("Poisoned lock".into()))?;
        blobs.remove(key);
        Ok(())
    }
}
