use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::clock::{Clock, SharedClock};
use crate::persistence::SessionRecord;
use crate::remote::{NewSessionRecord, RemoteSessionStore};

/// In-process remote store used in demo mode.
///
/// `set_offline(true)` makes every call fail, which mirrors an unreachable
/// backend.
#[derive(Clone)]
pub struct InMemorySessionStore {
    records: Arc<DashMap<String, SessionRecord>>,
    offline: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    clock: SharedClock,
}

impl InMemorySessionStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            offline: Arc::new(AtomicBool::new(false)),
            calls: Arc::new(AtomicUsize::new(0)),
            clock,
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total calls received, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn records_for(&self, session_id: &str) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .records
            .iter()
            .filter(|r| r.session_id == session_id)
            .map(|r| r.value().clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn check_online(&self) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.offline.load(Ordering::SeqCst) {
            anyhow::bail!("remote session store unreachable");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSessionStore for InMemorySessionStore {
    async fn insert_session(&self, record: &NewSessionRecord) -> anyhow::Result<String> {
        self.check_online()?;
        let id = Uuid::new_v4().to_string();
        self.records.insert(
            id.clone(),
            SessionRecord {
                id: id.clone(),
                session_id: record.session_id.clone(),
                user_id: record.user_id.clone(),
                data_types: record.data_types.clone(),
                created_at: self.clock.now(),
                expires_at: record.expires_at,
                cleaned_at: None,
            },
        );
        Ok(id)
    }

    async fn mark_session_cleaned(&self, session_id: &str) -> anyhow::Result<()> {
        self.check_online()?;
        let now = self.clock.now();
        for mut record in self.records.iter_mut() {
            if record.session_id == session_id && record.cleaned_at.is_none() {
                record.cleaned_at = Some(now);
            }
        }
        Ok(())
    }

    async fn run_batch_cleanup(&self) -> anyhow::Result<usize> {
        self.check_online()?;
        let now = self.clock.now();
        let mut cleaned = 0;
        for mut record in self.records.iter_mut() {
            if record.cleaned_at.is_none() && record.expires_at <= now {
                record.cleaned_at = Some(now);
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Duration;

    fn record(clock: &ManualClock, session_id: &str) -> NewSessionRecord {
        NewSessionRecord {
            session_id: session_id.into(),
            user_id: "u1".into(),
            data_types: vec!["patients".into()],
            expires_at: clock.now() + Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn test_offline_store_rejects_calls() {
        let clock = ManualClock::starting_now();
        let store = InMemorySessionStore::new(Arc::new(clock.clone()));
        store.set_offline(true);

        assert!(store.insert_session(&record(&clock, "s1")).await.is_err());
        assert!(store.is_empty());
        assert_eq!(store.call_count(), 1);
    }

    #[tokio::test]
    async fn test_mark_cleaned_is_idempotent() {
        let clock = ManualClock::starting_now();
        let store = InMemorySessionStore::new(Arc::new(clock.clone()));
        store.insert_session(&record(&clock, "s1")).await.unwrap();

        store.mark_session_cleaned("s1").await.unwrap();
        let first = store.records_for("s1")[0].cleaned_at;
        clock.advance_minutes(5);
        store.mark_session_cleaned("s1").await.unwrap();

        assert!(first.is_some());
        assert_eq!(store.records_for("s1")[0].cleaned_at, first);
    }
}
