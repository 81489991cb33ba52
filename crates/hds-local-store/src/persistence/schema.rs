//! Row types for the local SQLite database
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Durable mirror of a data session, as kept by the session record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub data_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cleaned_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_cleaned(&self) -> bool {
        self.cleaned_at.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub total_kv_entries: i64,
    pub total_session_records: i64,
    pub open_session_records: i64,
    pub database_size_bytes: i64,
}

pub(crate) fn parse_timestamp(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow::anyhow!("Failed to parse timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
