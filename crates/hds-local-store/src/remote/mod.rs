//! Remote session store collaborator.
//!
//! The durable mirror of data sessions lives behind [`RemoteSessionStore`].
//! Local state is always the source of truth; everything here is advisory
//! except the insert performed while creating a session.

pub mod in_memory;
pub mod sqlite;
pub mod sync;

pub use in_memory::InMemorySessionStore;
pub use sqlite::SqliteSessionStore;
pub use sync::{RemoteSync, RetryPolicy, SyncTask};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session record as sent to the remote store on creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub data_types: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait RemoteSessionStore: Send + Sync {
    /// Persists the record and returns its durable id.
    async fn insert_session(&self, record: &NewSessionRecord) -> anyhow::Result<String>;

    /// Marks the session as cleaned. Must be idempotent.
    async fn mark_session_cleaned(&self, session_id: &str) -> anyhow::Result<()>;

    /// Runs the store-side cleanup job and returns how many records it touched.
    async fn run_batch_cleanup(&self) -> anyhow::Result<usize>;
}
