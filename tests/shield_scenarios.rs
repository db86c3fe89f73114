/*!
 * End-to-end behaviour of the shield over an in-memory store
 */

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use vigil::{
    CorruptionKind, ResolutionStrategy, Shield, ShieldConfig, ShieldState, StateThresholds,
    ThreatKind, ThreatReport, TierImage, VersionedRecord, INDEX_KEY,
};
use vigil_store::MemoryStore;

fn seed(store: &MemoryStore, tier: &str) {
    store.insert(tier, "alpha", br#"{"n":1}"#);
    store.insert(tier, "beta", br#"{"n":2}"#);
    store.insert(tier, INDEX_KEY, br#"["alpha","beta"]"#);
}

fn seeded() -> (Shield, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for tier in ShieldConfig::default().tier_names() {
        seed(&store, &tier);
    }
    let shield = Shield::new(ShieldConfig::default(), store.clone()).unwrap();
    (shield, store)
}

async fn image_of(store: &MemoryStore, tier: &str) -> TierImage {
    TierImage::capture(store, tier, Duration::from_secs(1))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_single_level_four_threat_reaches_critical() {
    let (shield, _store) = seeded();

    let id = shield.report_threat(
        ThreatReport::new(ThreatKind::Memory, 4, "disk", "disk full").with_details(json!({})),
    );

    let status = shield.status();
    assert_eq!(status.aggregated_level, 80);
    // 80 is past the default critical cutoff of 75
    assert_eq!(status.state, ShieldState::Critical);
    assert!(status.active_threats.contains(&id));
    assert_eq!(status.per_kind_activation.get(&ThreatKind::Memory), Some(&true));
}

#[tokio::test]
async fn test_level_eighty_is_high_below_a_raised_critical_cutoff() {
    let mut config = ShieldConfig::default();
    config.thresholds = StateThresholds {
        elevated: 25,
        high: 50,
        critical: 85,
        hysteresis: 0,
    };
    let shield = Shield::new(config, Arc::new(MemoryStore::new())).unwrap();

    shield.report_threat(ThreatReport::new(ThreatKind::Memory, 4, "disk", "disk full"));

    assert_eq!(shield.status().aggregated_level, 80);
    assert_eq!(shield.state(), ShieldState::High);
}

#[tokio::test]
async fn test_state_follows_the_mean_of_active_threats() {
    let (shield, _store) = seeded();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let _sub = shield.subscribe_state_change(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let low = shield.report_threat(ThreatReport::new(ThreatKind::Stability, 2, "sensor", "jitter"));
    assert_eq!(shield.state(), ShieldState::Elevated);

    let high = shield.report_threat(ThreatReport::new(ThreatKind::Execution, 4, "exec", "stalls"));
    // (40 + 80) / 2
    assert_eq!(shield.status().aggregated_level, 60);
    assert_eq!(shield.state(), ShieldState::High);

    assert!(shield.resolve_threat(high));
    assert_eq!(shield.state(), ShieldState::Elevated);
    assert!(shield.resolve_threat(low));
    assert_eq!(shield.state(), ShieldState::Normal);
    assert!(!shield.resolve_threat(low));

    let path: Vec<_> = shield.transitions().iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![
            ShieldState::Elevated,
            ShieldState::High,
            ShieldState::Elevated,
            ShieldState::Normal
        ]
    );
    assert_eq!(seen.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_queries_filter_by_kind_and_level() {
    let (shield, _store) = seeded();
    shield.report_threat(ThreatReport::new(ThreatKind::Stability, 2, "a", "x"));
    shield.report_threat(ThreatReport::new(ThreatKind::Stability, 3, "b", "y"));
    shield.report_threat(ThreatReport::new(ThreatKind::Emotional, 3, "c", "z"));

    assert_eq!(shield.threats_by_kind(ThreatKind::Stability).len(), 2);
    assert_eq!(shield.threats_by_level(3).len(), 2);
    assert_eq!(shield.active_threats().len(), 3);
}

#[tokio::test]
async fn test_rollback_restores_the_chosen_snapshot() {
    let (shield, store) = seeded();

    let first = shield.force_snapshot(Some("primary")).await.unwrap().remove(0);
    store.insert("primary", "alpha", br#"{"n":100}"#);
    let second = shield.force_snapshot(Some("primary")).await.unwrap().remove(0);
    assert_ne!(first.checksum, second.checksum);

    assert!(shield.rollback_to_snapshot(first.id).await);

    let restored = image_of(&store, "primary").await;
    assert_eq!(restored, first.image().unwrap());
    assert_ne!(restored, second.image().unwrap());

    // The restored image is the new reference, so it checks clean
    let check = shield.force_integrity_check(Some("primary")).await.unwrap();
    assert!(check[0].passed, "{:?}", check[0].issues);
    assert!(!check[0].has_issue(CorruptionKind::ChecksumMismatch));
    assert_eq!(shield.metrics().rollbacks, 1);
}

#[tokio::test]
async fn test_rollback_to_unknown_snapshot_is_refused() {
    let (shield, _store) = seeded();
    assert!(!shield.rollback_to_snapshot(uuid::Uuid::new_v4()).await);
    assert_eq!(shield.metrics().rollbacks, 0);
}

#[tokio::test]
async fn test_snapshot_versions_increase_by_one() {
    let (shield, _store) = seeded();

    for _ in 0..3 {
        shield.force_snapshot(Some("secondary")).await.unwrap();
    }
    let all = shield.force_snapshot(None).await.unwrap();

    let versions: Vec<u64> = shield
        .snapshots("secondary")
        .iter()
        .map(|s| s.version)
        .collect();
    assert_eq!(versions, vec![1, 2, 3, 4]);
    assert_eq!(all.len(), 3);
    assert_eq!(shield.most_recent_snapshot("primary").unwrap().version, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_snapshots_get_consecutive_versions() {
    let (shield, store) = seeded();
    store.set_latency(Some(Duration::from_millis(5)));

    let snap = |shield: Shield| {
        tokio::spawn(async move {
            shield.force_snapshot(Some("primary")).await.unwrap().remove(0).version
        })
    };
    let (a, b, c, d, e) = tokio::join!(
        snap(shield.clone()),
        snap(shield.clone()),
        snap(shield.clone()),
        snap(shield.clone()),
        snap(shield.clone()),
    );

    let mut versions = vec![a.unwrap(), b.unwrap(), c.unwrap(), d.unwrap(), e.unwrap()];
    versions.sort_unstable();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);

    let retained: Vec<u64> = shield.snapshots("primary").iter().map(|s| s.version).collect();
    assert_eq!(retained, vec![1, 2, 3, 4, 5]);
    assert_eq!(shield.metrics().snapshots_taken, 5);
}

#[tokio::test]
async fn test_repeated_checks_agree() {
    let (shield, _store) = seeded();
    shield.force_snapshot(None).await.unwrap();

    let first = shield.force_integrity_check(Some("tertiary")).await.unwrap();
    let second = shield.force_integrity_check(Some("tertiary")).await.unwrap();

    assert_eq!(first[0].passed, second[0].passed);
    assert_eq!(first[0].issues, second[0].issues);
    assert_eq!(first[0].checksum, second[0].checksum);
    assert_eq!(shield.check_history().len(), 2);
}

#[tokio::test]
async fn test_check_records_one_event_per_corruption_kind() {
    let (shield, store) = seeded();
    shield.force_snapshot(Some("primary")).await.unwrap();

    store.insert("primary", "alpha", b"not json");
    store.insert("primary", "stray", br#"{}"#);
    store.remove("primary", "beta");

    let result = shield
        .force_integrity_check(Some("primary"))
        .await
        .unwrap()
        .remove(0);
    assert!(!result.passed);
    for kind in [
        CorruptionKind::MissingData,
        CorruptionKind::InvalidSchema,
        CorruptionKind::OrphanedData,
        CorruptionKind::ChecksumMismatch,
    ] {
        assert!(result.has_issue(kind), "missing {}", kind);
    }

    // A second failing check keeps the events and raises each kind again
    shield.force_integrity_check(Some("primary")).await.unwrap();
    let unresolved: Vec<_> = shield
        .corruption_events()
        .into_iter()
        .filter(|e| !e.resolved)
        .collect();
    assert_eq!(unresolved.len(), 4);
    assert!(unresolved.iter().all(|e| e.follow_ups.len() == 1));
    assert_eq!(shield.threats_by_kind(ThreatKind::Integrity).len(), 6);
    assert_eq!(shield.threats_by_kind(ThreatKind::Memory).len(), 2);
}

#[tokio::test]
async fn test_sync_conflict_resolved_with_newest_writes_remote() {
    let (shield, store) = seeded();
    let local = VersionedRecord::new(2, json!({"qty": 1}));
    let remote = VersionedRecord::new(3, json!({"qty": 5, "side": "buy"}));

    let conflict = shield
        .detect_sync_conflict("k", "primary", &local, &remote)
        .unwrap()
        .unwrap();
    assert_eq!(shield.pending_conflicts().len(), 1);

    // Same pair again: still one pending conflict
    let again = shield
        .detect_sync_conflict("k", "primary", &local, &remote)
        .unwrap()
        .unwrap();
    assert_eq!(again.id, conflict.id);
    assert_eq!(shield.pending_conflicts().len(), 1);
    assert_eq!(shield.metrics().conflicts_detected, 1);

    let resolved = shield
        .resolve_sync_conflict(conflict.id, Some(ResolutionStrategy::Newest))
        .await
        .unwrap();
    assert_eq!(resolved.payload, remote.payload);
    assert_eq!(resolved.version, 3);
    assert!(shield.pending_conflicts().is_empty());
    assert_eq!(shield.state(), ShieldState::Normal);

    let written = store.value("primary", "k").unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&written.bytes).unwrap();
    assert_eq!(payload, remote.payload);
    assert!(image_of(&store, "primary").await.data_keys().any(|k| k == "k"));

    assert!(shield
        .resolve_sync_conflict(conflict.id, None)
        .await
        .is_none());
}

#[tokio::test]
async fn test_equal_versions_are_not_a_conflict() {
    let (shield, _store) = seeded();
    let record = VersionedRecord::new(7, json!({"a": 1}));
    assert!(shield
        .detect_sync_conflict("k", "primary", &record, &record)
        .unwrap()
        .is_none());
    assert!(shield
        .detect_sync_conflict("k", "nowhere", &record, &record)
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_back_keeps_the_conflict_pending() {
    let (shield, store) = seeded();
    let conflict = shield
        .detect_sync_conflict(
            "k",
            "primary",
            &VersionedRecord::new(1, json!("old")),
            &VersionedRecord::new(2, json!("new")),
        )
        .unwrap()
        .unwrap();

    store.set_read_only(true);
    assert!(shield
        .resolve_sync_conflict(conflict.id, Some(ResolutionStrategy::Remote))
        .await
        .is_none());

    let pending = shield.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, conflict.id);
    assert_eq!(
        shield.metrics().conflict_write_failures,
        u64::from(shield.config().sync.max_retries)
    );

    store.set_read_only(false);
    assert!(shield
        .resolve_sync_conflict(conflict.id, Some(ResolutionStrategy::Remote))
        .await
        .is_some());
    assert!(shield.pending_conflicts().is_empty());
}

#[tokio::test]
async fn test_quota_cleanup_removes_at_least_half() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "primary");
    let mut config = ShieldConfig::default();
    config.quota.budget_bytes = Some(1);
    let shield = Shield::new(config, store).unwrap();

    for _ in 0..5 {
        shield.force_snapshot(Some("primary")).await.unwrap();
    }
    let report = shield.run_quota_check();

    assert_eq!(report.snapshots_before, 5);
    assert!(shield.all_snapshots().len() <= 3);
    assert_eq!(report.snapshots_removed, 3);
    assert_eq!(shield.metrics().quota_cleanups, 1);
    assert_eq!(shield.metrics().snapshots_evicted, 3);

    // The survivors are the newest ones
    let versions: Vec<u64> = shield.snapshots("primary").iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![4, 5]);
    assert!(shield.ensure_quota().is_err());
    assert_eq!(shield.state(), ShieldState::Critical);
}

#[tokio::test]
async fn test_quota_warning_then_recovery() {
    let store = Arc::new(MemoryStore::new());
    seed(&store, "primary");
    let shield = Shield::new(ShieldConfig::default(), store).unwrap();

    let size = shield.force_snapshot(Some("primary")).await.unwrap()[0].size_bytes;
    let mut config = shield.config();
    config.quota.budget_bytes = Some(size * 100 / 85);
    shield.reconfigure(config.clone()).await.unwrap();

    let usage = shield.check_quota();
    assert!((85.0..95.0).contains(&usage), "usage {}", usage);
    assert_eq!(shield.all_snapshots().len(), 1);
    assert_eq!(shield.metrics().quota_warnings, 1);
    let quota_threats = shield.threats_by_level(3);
    assert_eq!(quota_threats.len(), 1);

    // Same severity again is not a new threat
    shield.check_quota();
    assert_eq!(shield.metrics().quota_warnings, 1);

    config.quota.budget_bytes = Some(size * 100);
    shield.reconfigure(config).await.unwrap();
    assert!(shield.check_quota() < 80.0);
    assert!(shield.threat(quota_threats[0].id).unwrap().resolved);
    assert_eq!(shield.state(), ShieldState::Normal);
}

#[tokio::test]
async fn test_unreachable_store_is_critical_until_it_returns() {
    let (shield, store) = seeded();
    store.set_unavailable(true);

    let result = shield
        .force_integrity_check(Some("primary"))
        .await
        .unwrap()
        .remove(0);
    assert!(result.has_issue(CorruptionKind::StoreUnavailable));
    assert!(shield.force_snapshot(Some("primary")).await.unwrap().is_empty());
    assert_eq!(shield.state(), ShieldState::Critical);
    assert!(shield.metrics().store_failures >= 1);

    store.set_unavailable(false);
    let result = shield
        .force_integrity_check(Some("primary"))
        .await
        .unwrap()
        .remove(0);
    assert!(result.passed);
    assert_eq!(shield.state(), ShieldState::Normal);
}
