//! Local persistence - the key-value primitive and the SQLite database behind it
pub mod kv_store;
pub mod migration;
pub mod schema;
pub mod session_records;

pub use kv_store::{InMemoryKeyValueStore, KeyValueStore, SqliteKeyValueStore};
pub use migration::MigrationManager;
pub use schema::{format_timestamp, DatabaseStats, SessionRecord};
pub use session_records::SessionRecordStore;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Local SQLite database holding the key-value entries and the durable
/// session records.
pub struct LocalDatabase {
    pub key_values: Arc<SqliteKeyValueStore>,
    pub sessions: Arc<SessionRecordStore>,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl LocalDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening local database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        info!("Local database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Every connection of `SqliteConnectionManager::memory()` is its own
    /// database, so the pool is capped at a single connection.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self {
            key_values: Arc::new(SqliteKeyValueStore::new(Arc::clone(&pool))),
            sessions: Arc::new(SessionRecordStore::new(Arc::clone(&pool))),
            pool,
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }

    pub fn purge_cleaned_sessions(&self, older_than_days: i64) -> anyhow::Result<usize> {
        let mut conn = self.pool.get()?;
        let mut migrator = MigrationManager::new(&mut conn);
        Ok(migrator.purge_cleaned_sessions(older_than_days)?)
    }
}

impl Drop for LocalDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
