//! In-memory compartment store with per-compartment TTL.
//!
//! Every compartment carries a lifecycle tag. Cleanup moves it
//! `Active -> CleaningUp -> Gone` and leaves a tombstone behind, so a timer
//! that fires after an explicit cleanup finds `Gone` and does nothing.
//! Tombstones are pruned by the sweep.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SharedClock};
use crate::compartment::compartment_config::{CompartmentConfig, StoreSettings};
use crate::compartment::notifier::{CleanupNotice, CleanupNotifier, CleanupReason, TracingNotifier};
use crate::error::CompartmentError;
use crate::metrics;
use crate::persistence::{format_timestamp, KeyValueStore};

/// A record as held by a compartment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub data: Value,
    pub compartment_id: String,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompartmentState {
    Active,
    CleaningUp,
    Gone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Cleaned {
        records_purged: usize,
        keys_scrubbed: usize,
    },
    AlreadyGone,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub cleaned: usize,
    pub records_purged: usize,
    pub tombstones_pruned: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompartmentStats {
    /// Active compartments only.
    pub count: usize,
    pub total_records: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub cleaned_total: u64,
    pub records_purged_total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompartmentInfo {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub auto_cleanup: bool,
    pub interval_minutes: u32,
    pub state: CompartmentState,
    pub record_count: usize,
}

struct CompartmentEntry {
    user_id: String,
    session_id: String,
    created_at: DateTime<Utc>,
    auto_cleanup: bool,
    interval_minutes: u32,
    state: CompartmentState,
    collections: BTreeMap<String, Vec<StoredRecord>>,
    timer: Option<JoinHandle<()>>,
    gone_at: Option<DateTime<Utc>>,
}

impl CompartmentEntry {
    fn ttl(&self) -> ChronoDuration {
        ChronoDuration::minutes(i64::from(self.interval_minutes))
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at >= self.ttl()
    }

    fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }
}

struct StoreInner {
    compartments: DashMap<String, CompartmentEntry>,
    kv: Arc<dyn KeyValueStore>,
    notifier: Arc<dyn CleanupNotifier>,
    clock: SharedClock,
    settings: StoreSettings,
    sequence: AtomicU64,
    cleaned_total: AtomicU64,
    records_purged_total: AtomicU64,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for mut entry in self.compartments.iter_mut() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }
}

/// Handle to a compartment store. Clones share state.
#[derive(Clone)]
pub struct CompartmentStore {
    inner: Arc<StoreInner>,
}

impl CompartmentStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, clock: SharedClock) -> Self {
        Self::with_settings(kv, clock, StoreSettings::default(), Arc::new(TracingNotifier))
    }

    pub fn with_settings(
        kv: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        settings: StoreSettings,
        notifier: Arc<dyn CleanupNotifier>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                compartments: DashMap::new(),
                kv,
                notifier,
                clock,
                settings,
                sequence: AtomicU64::new(0),
                cleaned_total: AtomicU64::new(0),
                records_purged_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn default_interval_minutes(&self) -> u32 {
        self.inner.settings.default_interval_minutes
    }

    /// Creates a compartment and, with auto-cleanup on, arms its one-shot timer.
    pub fn create_compartment(&self, config: CompartmentConfig) -> Result<String, CompartmentError> {
        config.validate()?;

        let now = self.inner.clock.now();
        let created_at = config.created_at.unwrap_or(now);
        let interval_minutes = config
            .interval_minutes(self.inner.settings.default_interval_minutes)
            .max(1);
        let id = self.generate_id(&config.user_id, &config.session_id, created_at);

        self.inner.compartments.insert(
            id.clone(),
            CompartmentEntry {
                user_id: config.user_id.clone(),
                session_id: config.session_id.clone(),
                created_at,
                auto_cleanup: config.auto_cleanup,
                interval_minutes,
                state: CompartmentState::Active,
                collections: BTreeMap::new(),
                timer: None,
                gone_at: None,
            },
        );

        if config.auto_cleanup {
            let remaining = ChronoDuration::minutes(i64::from(interval_minutes)) - (now - created_at);
            // A backdated creation time may already be past its TTL.
            let delay = remaining.to_std().unwrap_or_default();
            if let Some(timer) = self.spawn_timer(&id, delay) {
                if let Some(mut entry) = self.inner.compartments.get_mut(&id) {
                    entry.timer = Some(timer);
                }
            }
        }

        metrics::inc_compartments_created();
        info!(
            "Created compartment {} for session {} (ttl {} min, auto cleanup: {})",
            id, config.session_id, interval_minutes, config.auto_cleanup
        );
        Ok(id)
    }

    /// Replaces the `entity_type` collection. Unknown or expired ids are a no-op.
    pub fn store_data(&self, compartment_id: &str, entity_type: &str, records: Vec<Value>) {
        let now = self.inner.clock.now();
        let expired = {
            let Some(mut entry) = self.inner.compartments.get_mut(compartment_id) else {
                warn!("store_data: compartment {} not found", compartment_id);
                return;
            };
            if entry.state != CompartmentState::Active {
                debug!("store_data: compartment {} already cleaned up", compartment_id);
                return;
            }
            if entry.is_expired(now) {
                true
            } else {
                let stamped: Vec<StoredRecord> = records
                    .into_iter()
                    .map(|data| StoredRecord {
                        data,
                        compartment_id: compartment_id.to_string(),
                        stored_at: now,
                    })
                    .collect();
                debug!(
                    "Stored {} {} records in compartment {}",
                    stamped.len(),
                    entity_type,
                    compartment_id
                );
                entry.collections.insert(entity_type.to_string(), stamped);
                false
            }
        };

        if expired {
            warn!("store_data: compartment {} has expired; data dropped", compartment_id);
            self.cleanup_with_reason(compartment_id, CleanupReason::ExpiredOnRead);
        }
    }

    /// Records of `entity_type`, or empty when the compartment is unknown,
    /// cleaned up or past its TTL.
    pub fn get_data(&self, compartment_id: &str, entity_type: &str) -> Vec<StoredRecord> {
        let now = self.inner.clock.now();
        let expired = {
            let Some(entry) = self.inner.compartments.get(compartment_id) else {
                debug!("get_data: compartment {} not found", compartment_id);
                return Vec::new();
            };
            if entry.state != CompartmentState::Active {
                return Vec::new();
            }
            if !entry.is_expired(now) {
                return entry
                    .collections
                    .get(entity_type)
                    .cloned()
                    .unwrap_or_default();
            }
            true
        };

        if expired {
            self.cleanup_with_reason(compartment_id, CleanupReason::ExpiredOnRead);
        }
        Vec::new()
    }

    pub fn cleanup_compartment(&self, compartment_id: &str) -> CleanupOutcome {
        self.cleanup_with_reason(compartment_id, CleanupReason::Manual)
    }

    /// Cleans every active compartment at or past its own interval and prunes
    /// tombstones that have outlived theirs.
    pub fn cleanup_expired_compartments(&self) -> SweepReport {
        let now = self.inner.clock.now();
        let mut report = SweepReport::default();
        let mut expired = Vec::new();
        let mut stale_tombstones = Vec::new();

        for entry in self.inner.compartments.iter() {
            report.scanned += 1;
            match entry.state {
                CompartmentState::Active if entry.is_expired(now) => {
                    expired.push(entry.key().clone());
                }
                CompartmentState::Gone => {
                    if entry.gone_at.map_or(true, |at| now - at >= entry.ttl()) {
                        stale_tombstones.push(entry.key().clone());
                    }
                }
                _ => {}
            }
        }

        for id in expired {
            if let CleanupOutcome::Cleaned { records_purged, .. } =
                self.cleanup_with_reason(&id, CleanupReason::Sweep)
            {
                report.cleaned += 1;
                report.records_purged += records_purged;
            }
        }

        for id in stale_tombstones {
            if self
                .inner
                .compartments
                .remove_if(&id, |_, entry| entry.state == CompartmentState::Gone)
                .is_some()
            {
                report.tombstones_pruned += 1;
            }
        }

        if report.cleaned > 0 {
            info!(
                "Sweep cleaned {} expired compartments ({} records)",
                report.cleaned, report.records_purged
            );
        } else {
            debug!("Sweep found no expired compartments ({} scanned)", report.scanned);
        }
        report
    }

    pub fn get_stats(&self) -> CompartmentStats {
        let mut stats = CompartmentStats {
            cleaned_total: self.inner.cleaned_total.load(Ordering::Relaxed),
            records_purged_total: self.inner.records_purged_total.load(Ordering::Relaxed),
            ..Default::default()
        };

        for entry in self.inner.compartments.iter() {
            if entry.state != CompartmentState::Active {
                continue;
            }
            stats.count += 1;
            stats.total_records += entry.record_count();
            stats.oldest = Some(stats.oldest.map_or(entry.created_at, |t| t.min(entry.created_at)));
            stats.newest = Some(stats.newest.map_or(entry.created_at, |t| t.max(entry.created_at)));
        }
        stats
    }

    /// True while the compartment is active and within its TTL.
    pub fn is_active(&self, compartment_id: &str) -> bool {
        let now = self.inner.clock.now();
        self.inner
            .compartments
            .get(compartment_id)
            .map(|e| e.state == CompartmentState::Active && !e.is_expired(now))
            .unwrap_or(false)
    }

    pub fn state(&self, compartment_id: &str) -> Option<CompartmentState> {
        self.inner.compartments.get(compartment_id).map(|e| e.state)
    }

    pub fn entity_types(&self, compartment_id: &str) -> Vec<String> {
        self.inner
            .compartments
            .get(compartment_id)
            .filter(|e| e.state == CompartmentState::Active)
            .map(|e| e.collections.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn record_count(&self, compartment_id: &str) -> usize {
        self.inner
            .compartments
            .get(compartment_id)
            .filter(|e| e.state == CompartmentState::Active)
            .map(|e| e.record_count())
            .unwrap_or(0)
    }

    pub fn info(&self, compartment_id: &str) -> Option<CompartmentInfo> {
        self.inner.compartments.get(compartment_id).map(|e| CompartmentInfo {
            id: compartment_id.to_string(),
            user_id: e.user_id.clone(),
            session_id: e.session_id.clone(),
            created_at: e.created_at,
            auto_cleanup: e.auto_cleanup,
            interval_minutes: e.interval_minutes,
            state: e.state,
            record_count: e.record_count(),
        })
    }

    fn cleanup_with_reason(&self, compartment_id: &str, reason: CleanupReason) -> CleanupOutcome {
        let (session_id, timer, collections) = {
            let Some(mut entry) = self.inner.compartments.get_mut(compartment_id) else {
                debug!("cleanup: compartment {} not found", compartment_id);
                return CleanupOutcome::NotFound;
            };
            if entry.state != CompartmentState::Active {
                debug!("cleanup: compartment {} already cleaned up", compartment_id);
                return CleanupOutcome::AlreadyGone;
            }
            entry.state = CompartmentState::CleaningUp;
            (
                entry.session_id.clone(),
                entry.timer.take(),
                std::mem::take(&mut entry.collections),
            )
        };

        // The firing timer is the task running this cleanup.
        if let Some(timer) = timer {
            if reason != CleanupReason::TimerExpired {
                timer.abort();
            }
        }

        let records_purged: usize = collections.values().map(Vec::len).sum();
        drop(collections);
        let keys_scrubbed = self.scrub_keys(compartment_id, &session_id);

        if let Some(mut entry) = self.inner.compartments.get_mut(compartment_id) {
            entry.state = CompartmentState::Gone;
            entry.gone_at = Some(self.inner.clock.now());
        }

        self.inner.cleaned_total.fetch_add(1, Ordering::Relaxed);
        self.inner
            .records_purged_total
            .fetch_add(records_purged as u64, Ordering::Relaxed);
        metrics::inc_compartments_cleaned(reason.as_str(), records_purged);

        info!(
            "Cleaned compartment {} ({}): {} records purged, {} keys scrubbed",
            compartment_id,
            reason.as_str(),
            records_purged,
            keys_scrubbed
        );

        if records_purged > 0 {
            self.inner.notifier.notify(CleanupNotice {
                compartment_id: compartment_id.to_string(),
                session_id,
                records_purged,
                reason,
            });
        }

        CleanupOutcome::Cleaned {
            records_purged,
            keys_scrubbed,
        }
    }

    /// Removes persisted keys naming the compartment, and prefixed keys naming
    /// its session. Never an unscoped wipe.
    fn scrub_keys(&self, compartment_id: &str, session_id: &str) -> usize {
        let prefixes = &self.inner.settings.scrub_prefixes;
        let predicate = |key: &str| {
            key.contains(compartment_id)
                || (!session_id.is_empty()
                    && names_session(key, session_id)
                    && prefixes.iter().any(|p| key.starts_with(p.as_str())))
        };

        match self.inner.kv.remove_matching(&predicate) {
            Ok(removed) => {
                for key in &removed {
                    debug!("Scrubbed persisted key {}", key);
                }
                removed.len()
            }
            Err(e) => {
                warn!("Failed to scrub keys for compartment {}: {}", compartment_id, e);
                0
            }
        }
    }

    fn generate_id(&self, user_id: &str, session_id: &str, created_at: DateTime<Utc>) -> String {
        let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(user_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(session_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(format_timestamp(created_at).as_bytes());
        hasher.update(&sequence.to_le_bytes());
        let hex = hasher.finalize().to_hex();
        format!("cmp_{}", &hex.as_str()[..32])
    }

    fn spawn_timer(&self, compartment_id: &str, delay: std::time::Duration) -> Option<JoinHandle<()>> {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No tokio runtime; compartment {} relies on the sweep for cleanup",
                    compartment_id
                );
                return None;
            }
        };

        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let id = compartment_id.to_string();
        Some(handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                let store = CompartmentStore { inner };
                store.cleanup_with_reason(&id, CleanupReason::TimerExpired);
            }
        }))
    }
}

/// True when `session_id` appears in `key` as a whole `_`-delimited token,
/// so `temp_s1_draft` names `s1` but `temp_s10_draft` does not.
fn names_session(key: &str, session_id: &str) -> bool {
    key.match_indices(session_id).any(|(start, _)| {
        let end = start + session_id.len();
        (start == 0 || key[..start].ends_with('_')) && (end == key.len() || key[end..].starts_with('_'))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::persistence::InMemoryKeyValueStore;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<CleanupNotice>>,
    }

    impl RecordingNotifier {
        fn count(&self) -> usize {
            self.notices.lock().unwrap().len()
        }
    }

    impl CleanupNotifier for RecordingNotifier {
        fn notify(&self, notice: CleanupNotice) {
            self.notices.lock().unwrap().push(notice);
        }
    }

    struct Fixture {
        store: CompartmentStore,
        clock: ManualClock,
        kv: InMemoryKeyValueStore,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let kv = InMemoryKeyValueStore::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let store = CompartmentStore::with_settings(
            Arc::new(kv.clone()),
            Arc::new(clock.clone()),
            StoreSettings::default(),
            notifier.clone(),
        );
        Fixture {
            store,
            clock,
            kv,
            notifier,
        }
    }

    fn manual(user: &str, session: &str, minutes: u32) -> CompartmentConfig {
        CompartmentConfig::new(user, session)
            .with_interval(minutes)
            .with_auto_cleanup(false)
    }

    fn patients(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({"id": i, "name": format!("p{}", i)})).collect()
    }

    #[test]
    fn test_store_then_get_returns_stamped_records_in_order() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        assert!(id.starts_with("cmp_"));
        assert_eq!(id.len(), 36);

        f.store.store_data(&id, "patients", patients(3));
        let records = f.store.get_data(&id, "patients");

        assert_eq!(records.len(), 3);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.data["id"], json!(i));
            assert_eq!(record.compartment_id, id);
            assert_eq!(record.stored_at, f.clock.now());
        }
    }

    #[test]
    fn test_store_replaces_previous_collection() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        f.store.store_data(&id, "patients", patients(3));
        f.store.store_data(&id, "patients", patients(1));
        assert_eq!(f.store.get_data(&id, "patients").len(), 1);
    }

    #[test]
    fn test_unknown_compartment_is_silent() {
        let f = fixture();
        f.store.store_data("cmp_missing", "patients", patients(2));
        assert!(f.store.get_data("cmp_missing", "patients").is_empty());
        assert_eq!(f.store.cleanup_compartment("cmp_missing"), CleanupOutcome::NotFound);
    }

    #[test]
    fn test_ids_are_unique_for_identical_configs() {
        let f = fixture();
        let a = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        let b = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_cleanup_is_idempotent_and_notifies_once() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        f.store.store_data(&id, "patients", patients(2));
        f.store.store_data(&id, "invoices", patients(1));

        assert_eq!(
            f.store.cleanup_compartment(&id),
            CleanupOutcome::Cleaned {
                records_purged: 3,
                keys_scrubbed: 0
            }
        );
        assert_eq!(f.store.cleanup_compartment(&id), CleanupOutcome::AlreadyGone);
        assert_eq!(f.notifier.count(), 1);
        assert_eq!(f.notifier.notices.lock().unwrap()[0].records_purged, 3);
        assert_eq!(f.store.state(&id), Some(CompartmentState::Gone));
        assert!(f.store.get_data(&id, "patients").is_empty());
    }

    #[test]
    fn test_empty_compartment_cleanup_does_not_notify() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        f.store.cleanup_compartment(&id);
        assert_eq!(f.notifier.count(), 0);
    }

    #[test]
    fn test_scrub_is_scoped_to_compartment_and_session() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        for key in [
            format!("cache_{}", id),
            "temp_s1_draft".to_string(),
            "demo_session_s1".to_string(),
            "temp_s2_draft".to_string(),
            "settings_s1".to_string(),
            "theme".to_string(),
        ] {
            f.kv.set(&key, "x").unwrap();
        }

        let outcome = f.store.cleanup_compartment(&id);
        assert_eq!(
            outcome,
            CleanupOutcome::Cleaned {
                records_purged: 0,
                keys_scrubbed: 3
            }
        );

        let mut remaining = f.kv.keys().unwrap();
        remaining.sort();
        assert_eq!(remaining, vec!["settings_s1", "temp_s2_draft", "theme"]);
    }

    #[test]
    fn test_scrub_leaves_sessions_sharing_an_id_prefix() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        let other = f.store.create_compartment(manual("u1", "s10", 30)).unwrap();
        for key in [
            "demo_session_s1",
            "temp_s1_draft",
            "demo_session_s10",
            "temp_s10_draft",
            "temp_s1abc",
            "demo_xs1",
        ] {
            f.kv.set(key, "x").unwrap();
        }

        f.store.cleanup_compartment(&id);

        let mut remaining = f.kv.keys().unwrap();
        remaining.sort();
        assert_eq!(
            remaining,
            vec!["demo_session_s10", "demo_xs1", "temp_s10_draft", "temp_s1abc"]
        );
        assert!(f.store.is_active(&other));
    }

    #[test]
    fn test_names_session_matches_whole_tokens() {
        assert!(names_session("demo_session_s1", "s1"));
        assert!(names_session("temp_s1_draft", "s1"));
        assert!(names_session("s1", "s1"));
        assert!(names_session("temp_s10_s1", "s1"));
        assert!(names_session("temp_sess_1_x", "sess_1"));
        assert!(!names_session("demo_session_s10", "s1"));
        assert!(!names_session("temp_xs1_draft", "s1"));
    }

    #[test]
    fn test_sweep_removes_expired_compartment() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 1)).unwrap();
        f.store.store_data(&id, "patients", patients(3));

        f.clock.advance(ChronoDuration::seconds(61));
        let report = f.store.cleanup_expired_compartments();

        assert_eq!(report.cleaned, 1);
        assert_eq!(report.records_purged, 3);
        assert!(f.store.get_data(&id, "patients").is_empty());
        assert_eq!(f.store.get_stats().count, 0);
        assert_eq!(f.notifier.notices.lock().unwrap()[0].reason, CleanupReason::Sweep);
    }

    #[test]
    fn test_sweep_respects_each_interval() {
        let f = fixture();
        let short = f.store.create_compartment(manual("u1", "s1", 5)).unwrap();
        let long = f.store.create_compartment(manual("u1", "s2", 10)).unwrap();

        f.clock.advance_minutes(5);
        let report = f.store.cleanup_expired_compartments();

        assert_eq!(report.cleaned, 1);
        assert!(!f.store.is_active(&short));
        assert!(f.store.is_active(&long));
    }

    #[test]
    fn test_sweep_prunes_old_tombstones() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 5)).unwrap();
        f.store.cleanup_compartment(&id);

        assert_eq!(f.store.cleanup_expired_compartments().tombstones_pruned, 0);
        f.clock.advance_minutes(5);
        assert_eq!(f.store.cleanup_expired_compartments().tombstones_pruned, 1);
        assert_eq!(f.store.state(&id), None);
    }

    #[test]
    fn test_expired_compartment_reads_empty() {
        let f = fixture();
        let id = f.store.create_compartment(manual("u1", "s1", 2)).unwrap();
        f.store.store_data(&id, "patients", patients(2));

        f.clock.advance_minutes(2);
        assert!(f.store.get_data(&id, "patients").is_empty());
        assert_eq!(f.store.state(&id), Some(CompartmentState::Gone));
        assert_eq!(
            f.notifier.notices.lock().unwrap()[0].reason,
            CleanupReason::ExpiredOnRead
        );
    }

    #[test]
    fn test_stats_aggregate_active_compartments() {
        let f = fixture();
        let first = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
        let created = f.clock.now();
        f.clock.advance_minutes(1);
        let second = f.store.create_compartment(manual("u1", "s2", 30)).unwrap();
        f.store.store_data(&first, "patients", patients(2));
        f.store.store_data(&second, "invoices", patients(1));

        let stats = f.store.get_stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.oldest, Some(created));
        assert_eq!(stats.newest, Some(f.clock.now()));
    }

    #[test]
    fn test_auto_cleanup_without_runtime_falls_back_to_sweep() {
        let f = fixture();
        let id = f
            .store
            .create_compartment(CompartmentConfig::new("u1", "s1").with_interval(1))
            .unwrap();
        f.clock.advance_minutes(1);
        assert_eq!(f.store.cleanup_expired_compartments().cleaned, 1);
        assert!(!f.store.is_active(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_cleans_compartment() {
        let f = fixture();
        let id = f
            .store
            .create_compartment(CompartmentConfig::new("u1", "s1").with_interval(1))
            .unwrap();
        f.store.store_data(&id, "patients", patients(3));

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(f.store.state(&id), Some(CompartmentState::Gone));
        assert_eq!(f.notifier.count(), 1);
        assert_eq!(
            f.notifier.notices.lock().unwrap()[0].reason,
            CleanupReason::TimerExpired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_cleanup_cancels_timer() {
        let f = fixture();
        let id = f
            .store
            .create_compartment(CompartmentConfig::new("u1", "s1").with_interval(1))
            .unwrap();
        f.store.store_data(&id, "patients", patients(1));
        f.store.cleanup_compartment(&id);

        tokio::time::advance(std::time::Duration::from_secs(120)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(f.notifier.count(), 1);
        assert_eq!(f.store.get_stats().cleaned_total, 1);
    }

    proptest! {
        #[test]
        fn prop_get_returns_exactly_what_was_stored(values in proptest::collection::vec(any::<i64>(), 0..40)) {
            let f = fixture();
            let id = f.store.create_compartment(manual("u1", "s1", 30)).unwrap();
            let records: Vec<Value> = values.iter().map(|v| json!({"id": v})).collect();

            f.store.store_data(&id, "patients", records.clone());
            let stored: Vec<Value> = f.store.get_data(&id, "patients").into_iter().map(|r| r.data).collect();

            prop_assert_eq!(stored, records);
        }
    }
}
