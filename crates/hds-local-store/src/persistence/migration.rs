//! Database migration system

use rusqlite::{Connection, OptionalExtension, Result};
use tracing::{error, info, warn};

use crate::persistence::schema::{format_timestamp, DatabaseStats};

/// Manages database schema migrations
pub struct MigrationManager<'a> {
    conn: &'a mut Connection,
}

impl<'a> MigrationManager<'a> {
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn }
    }

    /// Initialize database with current schema
    pub fn initialize_database(&mut self) -> Result<()> {
        info!("Initializing local store schema...");

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = self.get_current_version()?;
        info!("Current local store schema version: {}", current_version);

        self.apply_migrations(current_version)
    }

    fn apply_migrations(&mut self, current_version: i32) -> Result<()> {
        for (version, migration_sql) in get_migrations() {
            if version <= current_version {
                continue;
            }
            info!("Applying migration {}...", version);

            let tx = self.conn.transaction()?;
            if let Err(e) = tx.execute_batch(migration_sql) {
                error!("Failed to apply migration {}: {}", version, e);
                return Err(e);
            }
            tx.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
            tx.commit()?;

            info!("Migration {} applied successfully", version);
        }
        Ok(())
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .or_else(|_| Ok(0))
    }

    pub fn has_migration_applied(&self, version: i32) -> Result<bool> {
        self.conn
            .query_row(
                "SELECT 1 FROM schema_version WHERE version = ?",
                [version],
                |_| Ok(1),
            )
            .optional()
            .map(|result| result.is_some())
    }

    /// Drops durable session records that were marked cleaned before the cutoff.
    pub fn purge_cleaned_sessions(&mut self, older_than_days: i64) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::days(older_than_days);
        let deleted = self.conn.execute(
            "DELETE FROM data_sessions WHERE cleaned_at IS NOT NULL AND cleaned_at < ?1",
            [format_timestamp(cutoff)],
        )?;

        info!("Purged {} cleaned session records", deleted);
        if deleted > 0 {
            self.conn.execute_batch("VACUUM")?;
        }
        Ok(deleted)
    }
}

fn get_migrations() -> Vec<(i32, &'static str)> {
    vec![
        (1, include_str!("migrations/001_initial.sql")),
        (2, include_str!("migrations/002_session_expiry_index.sql")),
    ]
}

/// Read-only statistics; missing tables count as zero.
pub fn get_database_stats(conn: &Connection) -> Result<DatabaseStats> {
    fn table_count(conn: &Connection, query: &str) -> i64 {
        conn.query_row(query, [], |row| row.get(0)).unwrap_or_else(|e| {
            warn!("Failed to count rows ({}): {}", query, e);
            0
        })
    }

    let total_kv_entries = table_count(conn, "SELECT COUNT(*) FROM kv_entries");
    let total_session_records = table_count(conn, "SELECT COUNT(*) FROM data_sessions");
    let open_session_records = table_count(
        conn,
        "SELECT COUNT(*) FROM data_sessions WHERE cleaned_at IS NULL",
    );

    let database_size_bytes: i64 = conn
        .query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(DatabaseStats {
        total_kv_entries,
        total_session_records,
        open_session_records,
        database_size_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_repeatable() {
        let mut conn = Connection::open_in_memory().unwrap();
        {
            let mut migrator = MigrationManager::new(&mut conn);
            migrator.initialize_database().unwrap();
            migrator.initialize_database().unwrap();
            assert_eq!(migrator.get_current_version().unwrap(), 2);
            assert!(migrator.has_migration_applied(1).unwrap());
        }

        let stats = get_database_stats(&conn).unwrap();
        assert_eq!(stats.total_kv_entries, 0);
        assert_eq!(stats.total_session_records, 0);
    }
}
