use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::clock::{Clock, SharedClock};
use crate::persistence::SessionRecordStore;
use crate::remote::{NewSessionRecord, RemoteSessionStore};

/// Remote session store backed by the local SQLite database.
pub struct SqliteSessionStore {
    records: Arc<SessionRecordStore>,
    clock: SharedClock,
}

impl SqliteSessionStore {
    pub fn new(records: Arc<SessionRecordStore>, clock: SharedClock) -> Self {
        Self { records, clock }
    }

    /// Runs a pooled SQLite call on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SessionRecordStore) -> anyhow::Result<T> + Send + 'static,
    {
        let records = self.records.clone();
        tokio::task::spawn_blocking(move || op(&records))
            .await
            .map_err(|e| anyhow::anyhow!("session store task failed: {}", e))?
    }
}

#[async_trait]
impl RemoteSessionStore for SqliteSessionStore {
    async fn insert_session(&self, record: &NewSessionRecord) -> anyhow::Result<String> {
        let record = record.clone();
        self.blocking(move |records| {
            records.insert(
                &record.session_id,
                &record.user_id,
                &record.data_types,
                record.expires_at,
            )
        })
        .await
    }

    async fn mark_session_cleaned(&self, session_id: &str) -> anyhow::Result<()> {
        let id = session_id.to_string();
        let updated = self.blocking(move |records| records.mark_cleaned(&id)).await?;
        debug!("Marked {} record(s) cleaned for session {}", updated, session_id);
        Ok(())
    }

    async fn run_batch_cleanup(&self) -> anyhow::Result<usize> {
        let now = self.clock.now();
        self.blocking(move |records| records.clean_expired(now)).await
    }
}
