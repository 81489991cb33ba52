//! Maps external session ids to compartments and drives the periodic sweep.
//!
//! Creation is two-phase: the durable remote insert is awaited first and a
//! failure leaves no local trace. Everything after that is local and the
//! remote side of cleanup only goes through the [`RemoteSync`] queue.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::compartment::{CompartmentConfig, CompartmentStats, CompartmentStore, StoredRecord, SweepReport};
use crate::error::SessionError;
use crate::metrics;
use crate::persistence::KeyValueStore;
use crate::remote::{NewSessionRecord, RemoteSessionStore, RemoteSync, RetryPolicy};
use crate::session::session_config::{ManagerSettings, SessionConfig};

pub const SESSION_MARKER_PREFIX: &str = "demo_session_";

pub fn marker_key(session_id: &str) -> String {
    format!("{}{}", SESSION_MARKER_PREFIX, session_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub data_items_total: usize,
    pub compartments: CompartmentStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub compartment_id: String,
    pub remote_record_id: String,
    pub data_types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub record_count: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupCycleReport {
    pub sweep: SweepReport,
    pub mappings_dropped: usize,
}

#[derive(Debug, Clone)]
struct SessionEntry {
    user_id: String,
    compartment_id: String,
    remote_record_id: String,
    data_types: Vec<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

struct ManagerInner {
    store: CompartmentStore,
    remote: Arc<dyn RemoteSessionStore>,
    sync: RemoteSync,
    kv: Arc<dyn KeyValueStore>,
    settings: ManagerSettings,
    sessions: DashMap<String, SessionEntry>,
    /// Session ids whose remote insert is in flight.
    pending: DashSet<String>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let slot = self.sweeper.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        self.sync.shutdown();
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Must be called inside a tokio runtime; the remote sync worker is spawned here.
    pub fn new(
        store: CompartmentStore,
        remote: Arc<dyn RemoteSessionStore>,
        kv: Arc<dyn KeyValueStore>,
        settings: ManagerSettings,
        retry: RetryPolicy,
    ) -> anyhow::Result<Self> {
        if settings.sweep_interval_minutes == 0 {
            anyhow::bail!("Sweep interval must be at least one minute");
        }
        let sync = RemoteSync::spawn(remote.clone(), retry)?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                store,
                remote,
                sync,
                kv,
                settings,
                sessions: DashMap::new(),
                pending: DashSet::new(),
                sweeper: Mutex::new(None),
            }),
        })
    }

    pub fn store(&self) -> &CompartmentStore {
        &self.inner.store
    }

    pub fn remote_sync(&self) -> &RemoteSync {
        &self.inner.sync
    }

    /// Creates the durable record, then the compartment, mapping and marker.
    /// Returns the durable record id.
    pub async fn create_session(&self, config: SessionConfig) -> Result<String, SessionError> {
        config.validate()?;

        let Some(_reservation) = Reservation::acquire(&self.inner.pending, &config.session_id) else {
            return Err(SessionError::Validation(format!(
                "session {} is already being created",
                config.session_id
            )));
        };

        if let Some(existing) = self.compartment_for(&config.session_id) {
            if self.inner.store.is_active(&existing) {
                return Err(SessionError::Validation(format!(
                    "session {} is already active",
                    config.session_id
                )));
            }
            self.inner.sessions.remove(&config.session_id);
        }

        let expiry_minutes = config
            .expiry_minutes
            .unwrap_or(self.inner.settings.default_expiry_minutes);
        let now = self.inner.store.clock().now();
        let expires_at = now + ChronoDuration::minutes(i64::from(expiry_minutes));

        let record = NewSessionRecord {
            session_id: config.session_id.clone(),
            user_id: config.user_id.clone(),
            data_types: config.data_types.clone(),
            expires_at,
        };
        let remote_record_id = match self.inner.remote.insert_session(&record).await {
            Ok(id) => id,
            Err(e) => {
                error!("Failed to persist session {} remotely: {}", config.session_id, e);
                return Err(SessionError::Remote(e));
            }
        };

        // The store's TTL caps how long session data stays in memory.
        let compartment = CompartmentConfig::new(&config.user_id, &config.session_id)
            .with_interval(expiry_minutes.min(self.inner.store.default_interval_minutes()))
            .with_auto_cleanup(self.inner.settings.auto_cleanup)
            .created_at(now);
        let compartment_id = match self.inner.store.create_compartment(compartment) {
            Ok(id) => id,
            Err(e) => {
                // The durable record stays; it is only flagged as cleaned.
                self.inner.sync.mark_cleaned(&config.session_id);
                return Err(SessionError::Validation(e.to_string()));
            }
        };

        self.inner.sessions.insert(
            config.session_id.clone(),
            SessionEntry {
                user_id: config.user_id.clone(),
                compartment_id: compartment_id.clone(),
                remote_record_id: remote_record_id.clone(),
                data_types: config.data_types.clone(),
                created_at: now,
                expires_at,
            },
        );

        let marker = json!({
            "session_id": config.session_id,
            "compartment_id": compartment_id,
            "created_at": now,
            "data_types": config.data_types,
        });
        if let Err(e) = self
            .inner
            .kv
            .set(&marker_key(&config.session_id), &marker.to_string())
        {
            warn!("Failed to write marker for session {}: {}", config.session_id, e);
        }

        self.publish_active_sessions();
        info!(
            "Created session {} for user {} -> compartment {} (expires {})",
            config.session_id, config.user_id, compartment_id, expires_at
        );
        Ok(remote_record_id)
    }

    pub fn store_session_data(&self, session_id: &str, entity_type: &str, records: Vec<Value>) {
        let compartment_id = {
            let Some(entry) = self.inner.sessions.get(session_id) else {
                warn!("store_session_data: unknown session {}", session_id);
                return;
            };
            if !entry.data_types.iter().any(|t| t == entity_type) {
                warn!(
                    "store_session_data: entity type {} not declared for session {}",
                    entity_type, session_id
                );
                return;
            }
            entry.compartment_id.clone()
        };
        self.inner.store.store_data(&compartment_id, entity_type, records);
    }

    pub fn get_session_data(&self, session_id: &str, entity_type: &str) -> Vec<StoredRecord> {
        match self.compartment_for(session_id) {
            Some(compartment_id) => self.inner.store.get_data(&compartment_id, entity_type),
            None => {
                debug!("get_session_data: unknown session {}", session_id);
                Vec::new()
            }
        }
    }

    /// Returns false when the session was not mapped.
    pub fn cleanup_session(&self, session_id: &str) -> bool {
        let Some((_, entry)) = self.inner.sessions.remove(session_id) else {
            debug!("cleanup_session: unknown session {}", session_id);
            return false;
        };

        self.inner.store.cleanup_compartment(&entry.compartment_id);
        if let Err(e) = self.inner.kv.remove(&marker_key(session_id)) {
            warn!("Failed to remove marker for session {}: {}", session_id, e);
        }
        self.inner.sync.mark_cleaned(session_id);

        self.publish_active_sessions();
        info!("Cleaned up session {}", session_id);
        true
    }

    /// One sweep: expire compartments, request the remote batch job and drop
    /// mappings whose compartment is no longer active.
    pub fn run_cleanup_cycle(&self) -> CleanupCycleReport {
        let sweep = self.inner.store.cleanup_expired_compartments();
        self.inner.sync.batch_cleanup();

        let orphaned: Vec<(String, String)> = self
            .inner
            .sessions
            .iter()
            .filter(|e| !self.inner.store.is_active(&e.compartment_id))
            .map(|e| (e.key().clone(), e.compartment_id.clone()))
            .collect();

        let mut mappings_dropped = 0;
        for (session_id, compartment_id) in orphaned {
            if self.inner.sessions.remove(&session_id).is_none() {
                continue;
            }
            self.inner.store.cleanup_compartment(&compartment_id);
            if let Err(e) = self.inner.kv.remove(&marker_key(&session_id)) {
                warn!("Failed to remove marker for session {}: {}", session_id, e);
            }
            self.inner.sync.mark_cleaned(&session_id);
            mappings_dropped += 1;
        }

        self.publish_active_sessions();
        if mappings_dropped > 0 || sweep.cleaned > 0 {
            info!(
                "Cleanup cycle: {} compartments expired, {} session mappings dropped",
                sweep.cleaned, mappings_dropped
            );
        }
        CleanupCycleReport {
            sweep,
            mappings_dropped,
        }
    }

    /// Starts the recurring sweep. Returns false if it was already running or
    /// no runtime is available.
    pub fn start_automatic_cleanup(&self) -> bool {
        let mut slot = self.inner.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Automatic cleanup already running");
            return false;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot start automatic cleanup without a tokio runtime: {}", e);
                return false;
            }
        };

        let period = Duration::from_secs(u64::from(self.inner.settings.sweep_interval_minutes) * 60);
        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        *slot = Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                SessionManager { inner }.run_cleanup_cycle();
            }
        }));

        info!(
            "Automatic cleanup started (every {} min)",
            self.inner.settings.sweep_interval_minutes
        );
        true
    }

    /// Returns false if the sweep was not running.
    pub fn stop_automatic_cleanup(&self) -> bool {
        let mut slot = self.inner.sweeper.lock().unwrap_or_else(|p| p.into_inner());
        match slot.take() {
            Some(handle) => {
                handle.abort();
                info!("Automatic cleanup stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_automatic_cleanup_running(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn get_session_stats(&self) -> SessionStats {
        let mut active_sessions = 0;
        let mut data_items_total = 0;
        for entry in self.inner.sessions.iter() {
            if self.inner.store.is_active(&entry.compartment_id) {
                active_sessions += 1;
                data_items_total += self.inner.store.record_count(&entry.compartment_id);
            }
        }
        SessionStats {
            active_sessions,
            data_items_total,
            compartments: self.inner.store.get_stats(),
        }
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        let entry = self.inner.sessions.get(session_id)?.value().clone();
        Some(SessionInfo {
            session_id: session_id.to_string(),
            active: self.inner.store.is_active(&entry.compartment_id),
            record_count: self.inner.store.record_count(&entry.compartment_id),
            user_id: entry.user_id,
            compartment_id: entry.compartment_id,
            remote_record_id: entry.remote_record_id,
            data_types: entry.data_types,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
        })
    }

    /// Waits for queued remote calls.
    pub async fn flush(&self) {
        self.inner.sync.flush().await;
    }

    pub async fn shutdown(&self) {
        self.stop_automatic_cleanup();
        self.inner.sync.flush().await;
        self.inner.sync.shutdown();
        info!("Session manager shut down");
    }

    fn compartment_for(&self, session_id: &str) -> Option<String> {
        self.inner
            .sessions
            .get(session_id)
            .map(|e| e.compartment_id.clone())
    }

    fn publish_active_sessions(&self) {
        let active = self
            .inner
            .sessions
            .iter()
            .filter(|e| self.inner.store.is_active(&e.compartment_id))
            .count();
        metrics::set_active_sessions(active);
    }
}

/// Holds a session id in the pending set until dropped, including when the
/// creating future is cancelled mid-await.
struct Reservation<'a> {
    pending: &'a DashSet<String>,
    session_id: String,
}

impl<'a> Reservation<'a> {
    fn acquire(pending: &'a DashSet<String>, session_id: &str) -> Option<Self> {
        pending.insert(session_id.to_string()).then(|| Self {
            pending,
            session_id: session_id.to_string(),
        })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.session_id);
    }
}
