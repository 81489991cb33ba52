//! Durable session records kept in the local SQLite database.
use crate::persistence::schema::{format_timestamp, parse_timestamp, SessionRecord};
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SessionRecordStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SessionRecordStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Inserts a session record and returns its durable id.
    pub fn insert(
        &self,
        session_id: &str,
        user_id: &str,
        data_types: &[String],
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<String> {
        let conn = self.get_conn()?;
        let id = Uuid::new_v4().to_string();
        let data_types_json = serde_json::to_string(data_types)?;

        conn.execute(
            "INSERT INTO data_sessions (id, session_id, user_id, data_types, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id,
                session_id,
                user_id,
                data_types_json,
                format_timestamp(Utc::now()),
                format_timestamp(expires_at),
            ],
        )?;

        debug!("Inserted session record {} for session {}", id, session_id);
        Ok(id)
    }

    /// Marks every open record of the session as cleaned. Idempotent.
    pub fn mark_cleaned(&self, session_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE data_sessions SET cleaned_at = ?1 WHERE session_id = ?2 AND cleaned_at IS NULL",
            params![format_timestamp(Utc::now()), session_id],
        )?;
        Ok(updated)
    }

    /// Marks every open record whose expiry has passed as cleaned.
    pub fn clean_expired(&self, now: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let now = format_timestamp(now);
        let updated = conn.execute(
            "UPDATE data_sessions SET cleaned_at = ?1 WHERE cleaned_at IS NULL AND expires_at <= ?1",
            [&now],
        )?;
        if updated > 0 {
            info!("Marked {} expired session records as cleaned", updated);
        }
        Ok(updated)
    }

    pub fn find_by_session(&self, session_id: &str) -> anyhow::Result<Vec<SessionRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, user_id, data_types, created_at, expires_at, cleaned_at
             FROM data_sessions
             WHERE session_id = ?1
             ORDER BY created_at",
        )?;

        let mut rows = stmt.query([session_id])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::row_to_record(row)?);
        }
        Ok(records)
    }

    fn row_to_record(row: &Row<'_>) -> anyhow::Result<SessionRecord> {
        let data_types: String = row.get(3)?;
        let created_at: String = row.get(4)?;
        let expires_at: String = row.get(5)?;
        let cleaned_at: Option<String> = row.get(6)?;

        Ok(SessionRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            user_id: row.get(2)?,
            data_types: serde_json::from_str(&data_types)?,
            created_at: parse_timestamp(&created_at)?,
            expires_at: parse_timestamp(&expires_at)?,
            cleaned_at: cleaned_at.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}
