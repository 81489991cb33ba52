use hds_local_store::compartment::{CleanupReason, StoreSettings};
use hds_local_store::remote::RetryPolicy;
use hds_local_store::session::ManagerSettings;
use hds_local_store::{
    ChannelNotifier, CompartmentStore, InMemoryKeyValueStore, InMemorySessionStore,
    KeyValueStore, ManualClock, SessionConfig, SessionError, SessionManager,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    manager: SessionManager,
    clock: ManualClock,
    kv: InMemoryKeyValueStore,
    remote: InMemorySessionStore,
    notices: tokio::sync::mpsc::UnboundedReceiver<hds_local_store::CleanupNotice>,
}

fn harness(auto_cleanup: bool) -> Harness {
    let clock = ManualClock::starting_now();
    let kv = InMemoryKeyValueStore::new();
    let remote = InMemorySessionStore::new(Arc::new(clock.clone()));
    let (notifier, notices) = ChannelNotifier::new();
    let store = CompartmentStore::with_settings(
        Arc::new(kv.clone()),
        Arc::new(clock.clone()),
        StoreSettings::default(),
        Arc::new(notifier),
    );
    let manager = SessionManager::new(
        store,
        Arc::new(remote.clone()),
        Arc::new(kv.clone()),
        ManagerSettings {
            default_expiry_minutes: 30,
            sweep_interval_minutes: 10,
            auto_cleanup,
        },
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::ZERO,
        },
    )
    .unwrap();
    Harness {
        manager,
        clock,
        kv,
        remote,
        notices,
    }
}

#[tokio::test(start_paused = true)]
async fn compartment_timer_purges_and_notifies() {
    let mut h = harness(true);
    h.manager
        .create_session(SessionConfig::new("u1", "s1", ["patients"]).with_expiry(1))
        .await
        .unwrap();
    h.manager
        .store_session_data("s1", "patients", vec![json!({"id": 1}), json!({"id": 2})]);

    tokio::time::advance(Duration::from_secs(61)).await;
    let notice = h.notices.recv().await.unwrap();

    assert_eq!(notice.session_id, "s1");
    assert_eq!(notice.records_purged, 2);
    assert_eq!(notice.reason, CleanupReason::TimerExpired);
    assert!(h.manager.get_session_data("s1", "patients").is_empty());
    assert!(h.kv.get("demo_session_s1").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn periodic_sweep_reconciles_mappings_and_remote() {
    let h = harness(false);
    h.manager
        .create_session(SessionConfig::new("u1", "s1", ["patients"]).with_expiry(5))
        .await
        .unwrap();
    h.manager
        .create_session(SessionConfig::new("u2", "s2", ["patients"]).with_expiry(60))
        .await
        .unwrap();
    assert!(h.manager.start_automatic_cleanup());

    h.clock.advance_minutes(6);
    tokio::time::advance(Duration::from_secs(10 * 60)).await;
    for _ in 0..5 {
        tokio::task::yield_now().await;
    }
    h.manager.flush().await;

    assert_eq!(h.manager.session_ids(), vec!["s2".to_string()]);
    assert!(h.remote.records_for("s1")[0].cleaned_at.is_some());
    assert!(h.remote.records_for("s2")[0].cleaned_at.is_none());

    assert!(h.manager.stop_automatic_cleanup());
    assert!(!h.manager.stop_automatic_cleanup());
}

#[tokio::test]
async fn offline_remote_blocks_creation_but_not_cleanup() {
    let h = harness(false);
    h.remote.set_offline(true);
    let err = h
        .manager
        .create_session(SessionConfig::new("u1", "s1", ["patients"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Remote(_)));
    assert!(h.manager.session_ids().is_empty());
    assert_eq!(h.manager.get_session_stats().compartments.count, 0);

    h.remote.set_offline(false);
    h.manager
        .create_session(SessionConfig::new("u1", "s1", ["patients"]))
        .await
        .unwrap();
    h.remote.set_offline(true);

    h.manager.cleanup_session("s1");
    h.manager.flush().await;

    assert!(h.manager.session_ids().is_empty());
    assert_eq!(h.manager.remote_sync().failures(), 1);
}
