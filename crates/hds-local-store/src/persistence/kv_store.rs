//! Key-value persistence primitive.
//!
//! The compartment store only uses it to scrub keys on cleanup; the vault
//! keeps its encrypted blobs here.

use crate::persistence::schema::format_timestamp;
use chrono::Utc;
use dashmap::DashMap;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::debug;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<bool>;
    fn keys(&self) -> anyhow::Result<Vec<String>>;

    /// Removes every key accepted by `predicate` and returns the removed keys.
    fn remove_matching(&self, predicate: &dyn Fn(&str) -> bool) -> anyhow::Result<Vec<String>> {
        let mut removed = Vec::new();
        for key in self.keys()? {
            if predicate(&key) && self.remove(&key)? {
                removed.push(key);
            }
        }
        Ok(removed)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryKeyValueStore {
    entries: Arc<DashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// SQLite-backed key-value store sharing the local database pool.
pub struct SqliteKeyValueStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteKeyValueStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO kv_entries (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, format_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM kv_entries WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    fn keys(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_entries ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        debug!("Enumerated {} persisted keys", keys.len());
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::LocalDatabase;

    fn exercise(store: &dyn KeyValueStore) {
        store.set("demo_patients_s1", "[]").unwrap();
        store.set("cmp_abc_invoices", "[1]").unwrap();
        store.set("settings_theme", "dark").unwrap();

        assert_eq!(store.get("settings_theme").unwrap().as_deref(), Some("dark"));
        store.set("settings_theme", "light").unwrap();
        assert_eq!(store.get("settings_theme").unwrap().as_deref(), Some("light"));

        let mut removed = store
            .remove_matching(&|k: &str| k.contains("cmp_abc") || k.starts_with("demo_"))
            .unwrap();
        removed.sort();
        assert_eq!(removed, vec!["cmp_abc_invoices", "demo_patients_s1"]);
        assert_eq!(store.keys().unwrap(), vec!["settings_theme".to_string()]);
        assert!(!store.remove("missing").unwrap());
    }

    #[test]
    fn test_in_memory_store() {
        let store = InMemoryKeyValueStore::new();
        exercise(&store);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let db = LocalDatabase::new(&dir.path().join("kv.db")).unwrap();
        exercise(db.key_values.as_ref());
    }
}
