/*!
 * The shield context handle
 *
 * `Shield` owns every component of the monitoring core and is the only entry
 * point for hosts. It is a cheap `Clone` over shared state, so the scheduler
 * loop and direct API callers operate on the same instance.
 *
 * # Locking
 *
 * Component locks are always taken in this order and never held across an
 * `.await` or while publishing on the event bus:
 *
 * ```text
 * threats → snapshots → conflicts → integrity → quota → metrics
 * ```
 *
 * Most methods take a single lock at a time; the order matters only where two
 * are nested.
 */

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vigil_store::VersionedStore;
use vigil_threat::{
    EventBus, ShieldState, ShieldStatus, StateTransition, Subscription, ThreatEvent, ThreatKind,
    ThreatMonitor, ThreatReport,
};

use crate::config::ShieldConfig;
use crate::conflict::{
    ConflictResolver, Detection, ResolutionStrategy, ResolvedConflict, SyncConflict,
    VersionedRecord,
};
use crate::error::{ErrorCategory, Result, VigilError};
use crate::integrity::image::{bounded, write_indexed};
use crate::integrity::{
    CheckHistory, ChecksumAlgorithm, CorruptionEvent, CorruptionKind, CorruptionLedger,
    IndexedJsonValidator, IntegrityCheckResult, IntegrityChecker, SchemaValidator, TierImage,
};
use crate::metrics::ShieldMetrics;
use crate::quota::{
    QuotaGovernor, QuotaReport, QuotaStatus, BUDGET_SCOPE, CRITICAL_SEVERITY, WARNING_SEVERITY,
};
use crate::repair::RepairActions;
use crate::scheduler::TierTimers;
use crate::snapshot::{MemorySnapshot, SnapshotMeta, SnapshotStore};

/// Source recorded on threats raised by the shield itself
pub const SHIELD_SOURCE: &str = "vigil";

/// Check history and corruption ledger, guarded together
#[derive(Debug)]
pub(crate) struct IntegrityState {
    pub(crate) history: CheckHistory,
    pub(crate) ledger: CorruptionLedger,
}

pub(crate) struct ShieldInner {
    pub(crate) config: RwLock<ShieldConfig>,
    pub(crate) store: Arc<dyn VersionedStore>,
    pub(crate) validator: Arc<dyn SchemaValidator>,
    pub(crate) bus: EventBus,
    pub(crate) enabled: AtomicBool,

    pub(crate) threats: Mutex<ThreatMonitor>,
    pub(crate) snapshots: Mutex<SnapshotStore>,
    pub(crate) conflicts: Mutex<ConflictResolver>,
    pub(crate) integrity: Mutex<IntegrityState>,
    pub(crate) quota: Mutex<QuotaGovernor>,
    pub(crate) metrics: Mutex<ShieldMetrics>,

    /// Per-tier timing; also the tick reentrancy guard
    pub(crate) timers: tokio::sync::Mutex<TierTimers>,
}

/// Protective monitoring core over a tiered, versioned store
///
/// ```no_run
/// use std::sync::Arc;
/// use vigil::{Shield, ShieldConfig};
/// use vigil_store::MemoryStore;
/// use vigil_threat::{ThreatKind, ThreatReport};
///
/// # async fn example() -> vigil::Result<()> {
/// let shield = Shield::new(ShieldConfig::default(), Arc::new(MemoryStore::new()))?;
///
/// let _sub = shield.subscribe_state_change(|t| println!("{} -> {}", t.from, t.to));
/// shield.report_threat(ThreatReport::new(ThreatKind::Execution, 3, "router", "order rejected"));
///
/// let monitor = shield.start_monitor();
/// // ...
/// monitor.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Shield {
    pub(crate) inner: Arc<ShieldInner>,
}

impl std::fmt::Debug for Shield {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = self.status();
        f.debug_struct("Shield")
            .field("state", &status.state)
            .field("aggregated_level", &status.aggregated_level)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Shield {
    /// Build a shield with the default structural predicate
    ///
    /// Fails only when the configuration is invalid.
    pub fn new(config: ShieldConfig, store: Arc<dyn VersionedStore>) -> Result<Self> {
        Self::with_validator(config, store, Arc::new(IndexedJsonValidator))
    }

    /// Build a shield with a custom structural predicate
    pub fn with_validator(
        config: ShieldConfig,
        store: Arc<dyn VersionedStore>,
        validator: Arc<dyn SchemaValidator>,
    ) -> Result<Self> {
        config.validate()?;
        let now = Utc::now();

        info!(
            "🛡️  Shield initialised | Tiers: {} | Interval: {}ms | Checksum: {} | Thresholds: {}/{}/{}",
            config.tier_names().join(", "),
            config.monitoring_interval_ms,
            config.checksum,
            config.thresholds.elevated,
            config.thresholds.high,
            config.thresholds.critical
        );

        let inner = ShieldInner {
            store,
            validator,
            bus: EventBus::new(),
            enabled: AtomicBool::new(config.enabled),
            threats: Mutex::new(ThreatMonitor::new(
                config.registry_limits(),
                config.thresholds,
                config.history_limit,
                now,
            )),
            snapshots: Mutex::new(SnapshotStore::new(config.max_snapshots)),
            conflicts: Mutex::new(ConflictResolver::new()),
            integrity: Mutex::new(IntegrityState {
                history: CheckHistory::new(config.history_limit),
                ledger: CorruptionLedger::new(config.history_limit),
            }),
            quota: Mutex::new(QuotaGovernor::new(
                config.quota.clone(),
                config.quota_budget_bytes(),
            )),
            metrics: Mutex::new(ShieldMetrics::new()),
            timers: tokio::sync::Mutex::new(TierTimers::default()),
            config: RwLock::new(config),
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Current configuration
    pub fn config(&self) -> ShieldConfig {
        self.inner.config.read().clone()
    }

    /// Apply a new configuration.
    ///
    /// Registry limits, thresholds, snapshot retention and quota settings take
    /// effect immediately; tier timers restart on the next tick.
    pub async fn reconfigure(&self, config: ShieldConfig) -> Result<()> {
        config.validate()?;
        let now = Utc::now();

        let (evicted, transition) = self.inner.threats.lock().reconfigure(
            config.registry_limits(),
            config.thresholds,
            now,
        );
        let dropped = self
            .inner
            .snapshots
            .lock()
            .set_max_snapshots(config.max_snapshots);
        *self.inner.quota.lock() =
            QuotaGovernor::new(config.quota.clone(), config.quota_budget_bytes());
        {
            let mut metrics = self.inner.metrics.lock();
            metrics.threats_evicted += evicted.len() as u64;
            metrics.snapshots_evicted += dropped.len() as u64;
        }

        self.inner.enabled.store(config.enabled, Ordering::SeqCst);
        *self.inner.config.write() = config;
        self.inner.timers.lock().await.reset();

        info!("🔧 Shield reconfigured");
        if let Some(transition) = transition {
            self.announce(&transition);
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn VersionedStore> {
        &self.inner.store
    }

    // ------------------------------------------------------------------
    // Threats
    // ------------------------------------------------------------------

    /// Record a threat and return its id
    pub fn report_threat(&self, report: ThreatReport) -> Uuid {
        self.raise(report).id
    }

    /// Mark a threat resolved. Unknown or already resolved ids return false.
    pub fn resolve_threat(&self, id: Uuid) -> bool {
        let now = Utc::now();
        let outcome = self.inner.threats.lock().resolve(id, now);
        let Some(outcome) = outcome else {
            return false;
        };

        let linked = self.inner.integrity.lock().ledger.resolve_by_threat(id, now);
        self.inner.metrics.lock().threats_resolved += 1;
        debug!("Resolved threat {} ({})", id, outcome.event.kind);

        if let Some(transition) = outcome.transition {
            self.announce(&transition);
        }
        // Follow-ups of the same corruption go with it
        let rest: Vec<Uuid> = linked.into_iter().filter(|t| *t != id).collect();
        self.settle_threats(&rest);
        true
    }

    pub fn status(&self) -> ShieldStatus {
        self.inner.threats.lock().status()
    }

    pub fn state(&self) -> ShieldState {
        self.inner.threats.lock().state()
    }

    pub fn metrics(&self) -> ShieldMetrics {
        self.inner.metrics.lock().clone()
    }

    pub fn threat(&self, id: Uuid) -> Option<ThreatEvent> {
        self.inner.threats.lock().registry().get(id).cloned()
    }

    /// Every retained threat, oldest first
    pub fn threats(&self) -> Vec<ThreatEvent> {
        self.inner.threats.lock().registry().events().cloned().collect()
    }

    pub fn active_threats(&self) -> Vec<ThreatEvent> {
        self.inner.threats.lock().registry().active().cloned().collect()
    }

    pub fn threats_by_kind(&self, kind: ThreatKind) -> Vec<ThreatEvent> {
        self.inner
            .threats
            .lock()
            .registry()
            .by_kind(kind)
            .cloned()
            .collect()
    }

    pub fn threats_by_level(&self, level: u8) -> Vec<ThreatEvent> {
        self.inner
            .threats
            .lock()
            .registry()
            .by_level(level)
            .cloned()
            .collect()
    }

    /// State transition history, oldest first
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.inner.threats.lock().transitions()
    }

    pub fn subscribe_threat_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ThreatEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_threat_events(callback)
    }

    pub fn subscribe_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateTransition) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe_state_change(callback)
    }

    pub(crate) fn raise(&self, report: ThreatReport) -> ThreatEvent {
        let outcome = self.inner.threats.lock().report(report, Utc::now());
        {
            let mut metrics = self.inner.metrics.lock();
            metrics.threats_reported += 1;
            if outcome.evicted.is_some() {
                metrics.threats_evicted += 1;
            }
        }

        let event = outcome.event;
        if event.level >= 4 {
            warn!(
                "⚠️  Threat [{}] level {} from {}: {}",
                event.kind, event.level, event.source, event.message
            );
        } else {
            info!(
                "Threat [{}] level {} from {}: {}",
                event.kind, event.level, event.source, event.message
            );
        }

        self.inner.bus.publish_threat(&event);
        if let Some(transition) = outcome.transition {
            self.announce(&transition);
        }
        event
    }

    /// Resolve a batch of threats with one recompute
    pub(crate) fn settle_threats(&self, ids: &[Uuid]) {
        if ids.is_empty() {
            return;
        }
        let (resolved, transition) = self.inner.threats.lock().resolve_many(ids, Utc::now());
        self.inner.metrics.lock().threats_resolved += resolved.len() as u64;
        if let Some(transition) = transition {
            self.announce(&transition);
        }
    }

    pub(crate) fn announce(&self, transition: &StateTransition) {
        if transition.to == ShieldState::Critical {
            warn!(
                "🚨 Shield state {} → {} (level {})",
                transition.from, transition.to, transition.level
            );
        } else {
            info!(
                "🛡️  Shield state {} → {} (level {})",
                transition.from, transition.to, transition.level
            );
        }
        self.inner.bus.publish_state_change(transition);
    }

    /// Raise a threat for a corruption and record it in the ledger
    pub(crate) fn record_corruption(
        &self,
        tier: &str,
        kind: CorruptionKind,
        severity: u8,
        affected_keys: Vec<String>,
        message: String,
    ) -> CorruptionEvent {
        let threat = self.raise(corruption_report(tier, kind, severity, &affected_keys, message));
        self.inner.integrity.lock().ledger.record(
            tier,
            kind,
            severity,
            affected_keys,
            threat.id,
            Utc::now(),
        )
    }

    /// Account for a failed store call; the tier becomes unverifiable
    /// Raise another threat for a corruption that is still open.
    ///
    /// The threat joins the open ledger event, so the corruption weighs more
    /// in the aggregate for every check that finds it again.
    fn reraise_corruption(
        &self,
        tier: &str,
        kind: CorruptionKind,
        severity: u8,
        affected_keys: &[String],
        message: String,
    ) {
        let threat = self.raise(corruption_report(tier, kind, severity, affected_keys, message));
        let joined = self.inner.integrity.lock().ledger.follow_up(tier, kind, threat.id);
        if !joined {
            // Resolved in the meantime
            self.settle_threats(&[threat.id]);
        }
    }

    pub(crate) fn store_failure(&self, tier: &str, operation: &str, error: &VigilError) {
        warn!("⚠️  Store {} failed for tier '{}': {}", operation, tier, error);
        self.inner.metrics.lock().store_failures += 1;

        let already = self
            .inner
            .integrity
            .lock()
            .ledger
            .unresolved_for(tier, CorruptionKind::StoreUnavailable)
            > 0;
        if !already {
            self.record_corruption(
                tier,
                CorruptionKind::StoreUnavailable,
                CorruptionKind::StoreUnavailable.default_severity(),
                Vec::new(),
                format!("cannot verify tier '{}': {} failed: {}", tier, operation, error),
            );
        }
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Check one tier, or every configured tier
    pub async fn force_integrity_check(
        &self,
        tier: Option<&str>,
    ) -> Result<Vec<IntegrityCheckResult>> {
        let mut results = Vec::new();
        for tier in self.target_tiers(tier)? {
            results.push(self.run_check(&tier).await);
        }
        Ok(results)
    }

    pub(crate) async fn run_check(&self, tier: &str) -> IntegrityCheckResult {
        let config = self.config();
        let (reference, algorithm) = match self.inner.snapshots.lock().reference(tier) {
            Some(snapshot) => (Some(snapshot.checksum.clone()), snapshot.algorithm),
            None => (None, config.checksum),
        };

        let checker = IntegrityChecker::with_validator(algorithm, Arc::clone(&self.inner.validator));
        let result = checker
            .check(
                self.inner.store.as_ref(),
                tier,
                reference.as_deref(),
                config.store_timeout(),
                Utc::now(),
            )
            .await;

        self.absorb_check(&result);
        result
    }

    /// Turn a check result into corruption events and threat resolutions.
    ///
    /// A kind that is still unresolved for the tier keeps its ledger event
    /// and gains a follow-up threat instead.
    fn absorb_check(&self, result: &IntegrityCheckResult) {
        let now = Utc::now();
        {
            let mut metrics = self.inner.metrics.lock();
            metrics.checks_run += 1;
            if !result.passed {
                metrics.checks_failed += 1;
            }
            if result.has_issue(CorruptionKind::StoreUnavailable) {
                metrics.store_failures += 1;
            }
        }

        let present: BTreeSet<CorruptionKind> = result.issues.iter().map(|i| i.kind).collect();
        let (cleared, known) = {
            let mut integrity = self.inner.integrity.lock();
            integrity.history.push(result.clone());

            let cleared = integrity.ledger.resolve_where(&result.tier, now, |kind| {
                !matches!(kind, CorruptionKind::QuotaExceeded | CorruptionKind::SyncConflict)
                    && !present.contains(&kind)
            });
            let known: BTreeSet<CorruptionKind> = present
                .iter()
                .copied()
                .filter(|kind| integrity.ledger.unresolved_for(&result.tier, *kind) > 0)
                .collect();
            (cleared, known)
        };

        if !cleared.is_empty() {
            info!(
                "✅ Tier '{}' recovered from {} corruption event(s)",
                result.tier,
                cleared.len()
            );
            self.settle_threats(&cleared);
        }

        for issue in &result.issues {
            let message = VigilError::Integrity {
                kind: issue.kind,
                tier: result.tier.clone(),
                detail: issue.description.clone(),
            }
            .to_string();

            if known.contains(&issue.kind) {
                self.reraise_corruption(
                    &result.tier,
                    issue.kind,
                    issue.severity,
                    &issue.affected_keys,
                    message,
                );
            } else {
                self.record_corruption(
                    &result.tier,
                    issue.kind,
                    issue.severity,
                    issue.affected_keys.clone(),
                    message,
                );
            }
        }
    }

    /// Retained check results, oldest first
    pub fn check_history(&self) -> Vec<IntegrityCheckResult> {
        self.inner.integrity.lock().history.results().cloned().collect()
    }

    pub fn last_check(&self, tier: &str) -> Option<IntegrityCheckResult> {
        self.inner.integrity.lock().history.latest(tier).cloned()
    }

    pub fn corruption_events(&self) -> Vec<CorruptionEvent> {
        self.inner.integrity.lock().ledger.events().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Snapshot one tier, or every configured tier.
    ///
    /// A tier that cannot be read is skipped and raises a store threat.
    pub async fn force_snapshot(&self, tier: Option<&str>) -> Result<Vec<MemorySnapshot>> {
        let mut taken = Vec::new();
        for tier in self.target_tiers(tier)? {
            if let Some(snapshot) = self.take_snapshot(&tier).await {
                taken.push(snapshot);
            }
        }
        Ok(taken)
    }

    pub(crate) async fn take_snapshot(&self, tier: &str) -> Option<MemorySnapshot> {
        let config = self.config();
        let image =
            match TierImage::capture(self.inner.store.as_ref(), tier, config.store_timeout()).await
            {
                Ok(image) => image,
                Err(e) => {
                    self.store_failure(tier, "snapshot", &e);
                    return None;
                }
            };

        self.keep_snapshot(tier, &image, config.checksum)
    }

    /// Fold a change the shield wrote itself into the tier's reference.
    ///
    /// The edited reference image is kept as a new snapshot, which becomes the
    /// reference, so the next check does not see the change as drift. Tiers
    /// without a sound reference are left alone.
    fn rebase_reference<F>(&self, tier: &str, edit: F) -> Option<MemorySnapshot>
    where
        F: FnOnce(&mut TierImage),
    {
        let reference = self.inner.snapshots.lock().reference(tier).cloned()?;
        if !reference.verify() {
            return None;
        }
        let mut image = match reference.image() {
            Ok(image) => image,
            Err(e) => {
                warn!("Reference of tier '{}' cannot be decoded: {}", tier, e);
                return None;
            }
        };

        let before = image.clone();
        edit(&mut image);
        if image == before {
            return None;
        }
        debug!("Rebasing reference of tier '{}' past v{}", tier, reference.version);
        self.keep_snapshot(tier, &image, self.config().checksum)
    }

    fn keep_snapshot(
        &self,
        tier: &str,
        image: &TierImage,
        algorithm: ChecksumAlgorithm,
    ) -> Option<MemorySnapshot> {
        let taken = self
            .inner
            .snapshots
            .lock()
            .take(tier, image, algorithm, Utc::now());
        match taken {
            Ok((snapshot, evicted)) => {
                {
                    let mut metrics = self.inner.metrics.lock();
                    metrics.snapshots_taken += 1;
                    metrics.snapshots_evicted += evicted.len() as u64;
                }
                info!(
                    "📸 Snapshot v{} of tier '{}' ({} entries, {} bytes)",
                    snapshot.version, tier, snapshot.entry_count, snapshot.size_bytes
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!("Snapshot of tier '{}' could not be encoded: {}", tier, e);
                None
            }
        }
    }

    /// Restore a tier from a snapshot, then re-check it.
    ///
    /// Returns false for an unknown id, a snapshot that fails verification,
    /// or a store failure during the restore.
    pub async fn rollback_to_snapshot(&self, id: Uuid) -> bool {
        match self.restore_snapshot(id).await {
            Ok(restored) => restored,
            Err((tier, e)) => {
                self.inner.metrics.lock().rollbacks_failed += 1;
                if e.category() == ErrorCategory::Store {
                    self.store_failure(&tier, "rollback", &e);
                } else {
                    warn!("Rollback of tier '{}' failed: {}", tier, e);
                }
                false
            }
        }
    }

    async fn restore_snapshot(&self, id: Uuid) -> std::result::Result<bool, (String, VigilError)> {
        let snapshot = self.inner.snapshots.lock().get(id).cloned();
        let Some(snapshot) = snapshot else {
            debug!("Rollback requested for unknown snapshot {}", id);
            return Ok(false);
        };
        let tier = snapshot.tier.clone();

        if !snapshot.verify() {
            self.inner.metrics.lock().rollbacks_failed += 1;
            self.record_corruption(
                &tier,
                CorruptionKind::ChecksumMismatch,
                CorruptionKind::ChecksumMismatch.default_severity(),
                Vec::new(),
                format!(
                    "snapshot v{} of tier '{}' does not reproduce its checksum",
                    snapshot.version, tier
                ),
            );
            return Ok(false);
        }

        let image = snapshot.image().map_err(|e| (tier.clone(), e))?;
        let timeout = self.config().store_timeout();
        image
            .restore(self.inner.store.as_ref(), &tier, timeout)
            .await
            .map_err(|e| (tier.clone(), e))?;

        self.inner.snapshots.lock().set_reference(id);
        self.inner.metrics.lock().rollbacks += 1;
        info!("⏪ Rolled back tier '{}' to snapshot v{}", tier, snapshot.version);

        self.run_check(&tier).await;
        Ok(true)
    }

    pub fn snapshot(&self, id: Uuid) -> Option<SnapshotMeta> {
        self.inner.snapshots.lock().get(id).map(MemorySnapshot::meta)
    }

    pub fn snapshots(&self, tier: &str) -> Vec<SnapshotMeta> {
        self.inner.snapshots.lock().snapshots(tier)
    }

    /// Every retained snapshot, oldest first
    pub fn all_snapshots(&self) -> Vec<SnapshotMeta> {
        self.inner.snapshots.lock().all_meta()
    }

    pub fn most_recent_snapshot(&self, tier: &str) -> Option<SnapshotMeta> {
        self.inner
            .snapshots
            .lock()
            .most_recent(tier)
            .map(MemorySnapshot::meta)
    }

    // ------------------------------------------------------------------
    // Conflicts
    // ------------------------------------------------------------------

    /// Compare two copies of a record.
    ///
    /// Returns the pending conflict for `(tier, key)` when the versions
    /// differ, `None` when they agree.
    pub fn detect_sync_conflict(
        &self,
        key: &str,
        tier: &str,
        local: &VersionedRecord,
        remote: &VersionedRecord,
    ) -> Result<Option<SyncConflict>> {
        self.require_tier(tier)?;
        let detection = self
            .inner
            .conflicts
            .lock()
            .detect(key, tier, local, remote, Utc::now());

        let conflict = match detection {
            Detection::InSync => return Ok(None),
            Detection::Existing(conflict) => return Ok(Some(conflict)),
            Detection::New(conflict) => conflict,
        };

        self.inner.metrics.lock().conflicts_detected += 1;
        let event = self.record_corruption(
            tier,
            CorruptionKind::SyncConflict,
            CorruptionKind::SyncConflict.default_severity(),
            vec![key.to_string()],
            format!(
                "'{}' in tier '{}' diverged: local v{}, remote v{}",
                key, tier, conflict.local_version, conflict.remote_version
            ),
        );

        let mut conflicts = self.inner.conflicts.lock();
        conflicts.link_threat(conflict.id, event.threat_id);
        Ok(conflicts.get(conflict.id).cloned().or(Some(conflict)))
    }

    /// Settle a pending conflict and write the chosen payload back.
    ///
    /// `None` selects the configured default strategy. Returns `None` for an
    /// unknown id or when every write attempt failed; in the latter case the
    /// conflict stays pending.
    pub async fn resolve_sync_conflict(
        &self,
        id: Uuid,
        strategy: Option<ResolutionStrategy>,
    ) -> Option<ResolvedConflict> {
        let config = self.config();
        let strategy = strategy.unwrap_or(config.sync.default_strategy);
        let (conflict, chosen) = self.inner.conflicts.lock().plan(id, strategy)?;

        let bytes = match serde_json::to_vec(&chosen.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Conflict {} payload cannot be encoded: {}", id, e);
                return None;
            }
        };

        let mut failures = 0u32;
        let store_version = loop {
            match write_indexed(
                self.inner.store.as_ref(),
                &conflict.tier,
                &conflict.key,
                bytes.clone(),
                config.store_timeout(),
            )
            .await
            {
                Ok(version) => break version,
                Err(e) => {
                    failures += 1;
                    self.inner.conflicts.lock().record_failure(id);
                    {
                        let mut metrics = self.inner.metrics.lock();
                        metrics.conflict_write_failures += 1;
                        metrics.store_failures += 1;
                    }
                    if failures >= config.sync.max_retries.max(1) {
                        warn!(
                            "⚠️  {}",
                            VigilError::Conflict {
                                id,
                                tier: conflict.tier.clone(),
                                key: conflict.key.clone(),
                            }
                        );
                        return None;
                    }
                    debug!(
                        "Write-back of '{}' failed (attempt {}): {}",
                        conflict.key, failures, e
                    );
                    tokio::time::sleep(config.sync.retry_delay() * failures).await;
                }
            }
        };

        let settled = self.inner.conflicts.lock().complete(id, strategy)?;
        self.inner.metrics.lock().conflicts_resolved += 1;
        if let Some(threat_id) = settled.threat_id {
            let mut linked = self
                .inner
                .integrity
                .lock()
                .ledger
                .resolve_by_threat(threat_id, Utc::now());
            if linked.is_empty() {
                linked.push(threat_id);
            }
            self.settle_threats(&linked);
        }
        self.rebase_reference(&conflict.tier, |image| {
            image.put_indexed(&conflict.key, bytes)
        });

        info!(
            "🔀 Resolved conflict on '{}' in tier '{}' with '{}' (v{})",
            conflict.key, conflict.tier, strategy, chosen.version
        );

        Some(ResolvedConflict {
            conflict_id: id,
            key: conflict.key,
            tier: conflict.tier,
            strategy,
            version: chosen.version,
            payload: chosen.payload,
            store_version,
        })
    }

    pub fn pending_conflicts(&self) -> Vec<SyncConflict> {
        self.inner.conflicts.lock().pending().to_vec()
    }

    // ------------------------------------------------------------------
    // Quota
    // ------------------------------------------------------------------

    /// Evaluate snapshot usage and return the usage percentage
    pub fn check_quota(&self) -> f64 {
        self.run_quota_check().usage_percent
    }

    /// Like [`Shield::check_quota`], but a critical usage is an error
    pub fn ensure_quota(&self) -> Result<f64> {
        let report = self.run_quota_check();
        if report.status == QuotaStatus::Critical {
            return Err(VigilError::QuotaExceeded {
                usage: report.usage_percent,
                budget_bytes: report.budget_bytes,
            });
        }
        Ok(report.usage_percent)
    }

    pub fn last_quota_report(&self) -> Option<QuotaReport> {
        self.inner.quota.lock().last_report().cloned()
    }

    /// Full quota pass: classification, threats, cleanup and tier overruns
    pub fn run_quota_check(&self) -> QuotaReport {
        let config = self.config();
        let now = Utc::now();

        let (used_bytes, snapshots_before) = {
            let snapshots = self.inner.snapshots.lock();
            (snapshots.total_bytes(), snapshots.count())
        };
        let live_sizes: Vec<(String, u64, u64)> = {
            let integrity = self.inner.integrity.lock();
            config
                .tiers
                .iter()
                .filter_map(|tier| {
                    integrity
                        .history
                        .latest(&tier.name)
                        .filter(|r| r.checksum.is_some())
                        .map(|r| (tier.name.clone(), r.size_bytes, tier.max_size_bytes))
                })
                .collect()
        };

        let (usage_percent, budget_bytes, status, clean, tier_overruns) = {
            let quota = self.inner.quota.lock();
            let usage = quota.usage_percent(used_bytes);
            let status = quota.classify(usage);
            let overruns = quota.tier_overruns(
                live_sizes
                    .iter()
                    .map(|(name, size, max)| (name.as_str(), *size, *max)),
            );
            (usage, quota.budget_bytes(), status, quota.should_clean(status), overruns)
        };

        match status {
            QuotaStatus::Ok => {
                let ids = self
                    .inner
                    .integrity
                    .lock()
                    .ledger
                    .resolve_kind(BUDGET_SCOPE, CorruptionKind::QuotaExceeded, now);
                self.settle_threats(&ids);
            }
            QuotaStatus::Warning | QuotaStatus::Critical => {
                let severity = if status == QuotaStatus::Critical {
                    CRITICAL_SEVERITY
                } else {
                    WARNING_SEVERITY
                };
                self.escalate_quota(status, severity, usage_percent, budget_bytes);
            }
        }

        let mut snapshots_removed = 0;
        if clean {
            let evicted = self
                .inner
                .snapshots
                .lock()
                .evict_oldest(QuotaGovernor::cleanup_count(snapshots_before));
            snapshots_removed = evicted.len();

            let trimmed_threats = self.inner.threats.lock().trim_history();
            let (trimmed_checks, trimmed_events) = {
                let mut integrity = self.inner.integrity.lock();
                (integrity.history.halve(), integrity.ledger.halve())
            };
            {
                let mut metrics = self.inner.metrics.lock();
                metrics.quota_cleanups += 1;
                metrics.snapshots_evicted += snapshots_removed as u64;
            }
            warn!(
                "🧹 Quota cleanup removed {} of {} snapshot(s), trimmed {} check(s), {} corruption event(s), {} history entries",
                snapshots_removed,
                snapshots_before,
                trimmed_checks,
                trimmed_events,
                trimmed_threats
            );
        }

        self.track_tier_overruns(&config, &tier_overruns, now);

        let report = QuotaReport {
            usage_percent,
            used_bytes,
            budget_bytes,
            status,
            snapshots_removed,
            snapshots_before,
            tier_overruns,
        };
        self.inner.quota.lock().record(report.clone());
        report
    }

    /// Raise a budget-wide quota threat unless one of the same severity is
    /// already active. A lower-severity one is superseded.
    fn escalate_quota(&self, status: QuotaStatus, severity: u8, usage: f64, budget_bytes: u64) {
        let now = Utc::now();
        let superseded = {
            let mut integrity = self.inner.integrity.lock();
            let current = integrity
                .ledger
                .unresolved()
                .any(|e| {
                    e.tier == BUDGET_SCOPE
                        && e.kind == CorruptionKind::QuotaExceeded
                        && e.severity == severity
                });
            if current {
                return;
            }
            integrity
                .ledger
                .resolve_kind(BUDGET_SCOPE, CorruptionKind::QuotaExceeded, now)
        };
        self.settle_threats(&superseded);

        {
            let mut metrics = self.inner.metrics.lock();
            match status {
                QuotaStatus::Critical => metrics.quota_criticals += 1,
                _ => metrics.quota_warnings += 1,
            }
        }
        let error = VigilError::QuotaExceeded { usage, budget_bytes };
        self.record_corruption(
            BUDGET_SCOPE,
            CorruptionKind::QuotaExceeded,
            severity,
            Vec::new(),
            format!("{} ({})", error, status),
        );
    }

    fn track_tier_overruns(
        &self,
        config: &ShieldConfig,
        overruns: &[crate::quota::TierOverrun],
        now: chrono::DateTime<Utc>,
    ) {
        for tier in &config.tiers {
            match overruns.iter().find(|o| o.tier == tier.name) {
                Some(overrun) => {
                    let active = self
                        .inner
                        .integrity
                        .lock()
                        .ledger
                        .unresolved_for(&tier.name, CorruptionKind::QuotaExceeded)
                        > 0;
                    if !active {
                        self.record_corruption(
                            &tier.name,
                            CorruptionKind::QuotaExceeded,
                            CorruptionKind::QuotaExceeded.default_severity(),
                            Vec::new(),
                            format!(
                                "tier '{}' holds {} bytes, capacity {}",
                                tier.name, overrun.size_bytes, overrun.max_size_bytes
                            ),
                        );
                    }
                }
                None => {
                    let ids = self.inner.integrity.lock().ledger.resolve_kind(
                        &tier.name,
                        CorruptionKind::QuotaExceeded,
                        now,
                    );
                    self.settle_threats(&ids);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------

    pub fn enable(&self) {
        if !self.inner.enabled.swap(true, Ordering::SeqCst) {
            info!("▶️  Monitoring enabled");
        }
    }

    /// Stop future ticks. A tick already running completes.
    pub fn disable(&self) {
        if self.inner.enabled.swap(false, Ordering::SeqCst) {
            info!("⏸️  Monitoring disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    fn require_tier(&self, tier: &str) -> Result<()> {
        if self.inner.config.read().tier(tier).is_none() {
            return Err(VigilError::UnknownTier(tier.to_string()));
        }
        Ok(())
    }

    fn target_tiers(&self, tier: Option<&str>) -> Result<Vec<String>> {
        match tier {
            Some(name) => {
                self.require_tier(name)?;
                Ok(vec![name.to_string()])
            }
            None => Ok(self.inner.config.read().tier_names()),
        }
    }
}

fn corruption_report(
    tier: &str,
    kind: CorruptionKind,
    severity: u8,
    affected_keys: &[String],
    message: String,
) -> ThreatReport {
    ThreatReport::new(kind.threat_kind(), severity, SHIELD_SOURCE, message).with_details(json!({
        "tier": tier,
        "corruption": kind,
        "affected_keys": affected_keys,
    }))
}

#[async_trait::async_trait]
impl RepairActions for Shield {
    async fn rollback_latest(&self, tier: &str) -> Result<bool> {
        let target = self.inner.snapshots.lock().reference(tier).map(|s| s.id);
        match target {
            Some(id) => self.restore_snapshot(id).await.map_err(|(_, e)| e),
            None => Ok(false),
        }
    }

    async fn purge_keys(&self, tier: &str, keys: &[String]) -> Result<()> {
        let timeout = self.config().store_timeout();
        for key in keys {
            bounded("delete", timeout, self.inner.store.delete(tier, key)).await?;
        }
        self.rebase_reference(tier, |image| {
            for key in keys {
                image.remove(key);
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TierConfig;
    use crate::integrity::INDEX_KEY;
    use vigil_store::MemoryStore;

    fn config() -> ShieldConfig {
        ShieldConfig {
            tiers: vec![TierConfig::new("primary", 1024 * 1024)],
            ..Default::default()
        }
    }

    fn seeded() -> (Shield, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.insert("primary", "a", br#"{"v":1}"#);
        store.insert("primary", INDEX_KEY, br#"["a"]"#);
        let shield = Shield::new(config(), store.clone()).unwrap();
        (shield, store)
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut bad = config();
        bad.thresholds.high = bad.thresholds.critical;
        let err = Shield::new(bad, Arc::new(MemoryStore::new())).unwrap_err();
        assert!(matches!(err, VigilError::Config(_)));
    }

    #[test]
    fn test_resolve_unknown_threat_is_false() {
        let (shield, _) = seeded();
        assert!(!shield.resolve_threat(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn test_repeated_failure_raises_follow_up_threats() {
        let (shield, store) = seeded();
        store.insert("primary", "b", b"{}");

        shield.force_integrity_check(Some("primary")).await.unwrap();
        shield.force_integrity_check(Some("primary")).await.unwrap();

        let orphans: Vec<_> = shield
            .corruption_events()
            .into_iter()
            .filter(|e| e.kind == CorruptionKind::OrphanedData)
            .collect();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].follow_ups.len(), 1);

        let active = shield.active_threats();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|t| t
            .message
            .starts_with("Integrity error (orphaned_data) in tier 'primary'")));

        // Resolving the follow-up settles the corruption and its first threat
        assert!(shield.resolve_threat(orphans[0].follow_ups[0]));
        assert!(shield.active_threats().is_empty());
        assert!(shield.corruption_events().iter().all(|e| e.resolved));
    }

    #[tokio::test]
    async fn test_passing_check_resolves_findings() {
        let (shield, store) = seeded();
        store.insert("primary", "b", b"{}");
        shield.force_integrity_check(None).await.unwrap();
        assert_eq!(shield.status().active_threats.len(), 1);

        store.remove("primary", "b");
        let results = shield.force_integrity_check(None).await.unwrap();
        assert!(results[0].passed);
        assert!(shield.status().active_threats.is_empty());
        assert_eq!(shield.state(), ShieldState::Normal);
    }

    #[tokio::test]
    async fn test_tampered_snapshot_is_not_restored() {
        let (shield, _) = seeded();
        let snapshot = shield.force_snapshot(Some("primary")).await.unwrap().remove(0);
        shield
            .inner
            .snapshots
            .lock()
            .get_mut(snapshot.id)
            .unwrap()
            .payload
            .push(0xff);

        assert!(!shield.rollback_to_snapshot(snapshot.id).await);
        assert_eq!(shield.metrics().rollbacks_failed, 1);
        assert_eq!(shield.metrics().rollbacks, 0);
        assert!(shield
            .corruption_events()
            .iter()
            .any(|e| e.kind == CorruptionKind::ChecksumMismatch && !e.resolved));
    }

    #[tokio::test]
    async fn test_unknown_tier_is_an_error() {
        let (shield, _) = seeded();
        let err = shield.force_snapshot(Some("nope")).await.unwrap_err();
        assert!(matches!(err, VigilError::UnknownTier(_)));
    }

    #[tokio::test]
    async fn test_store_outage_biases_to_critical() {
        let (shield, store) = seeded();
        store.set_unavailable(true);

        let results = shield.force_integrity_check(Some("primary")).await.unwrap();
        assert!(results[0].has_issue(CorruptionKind::StoreUnavailable));
        assert_eq!(shield.state(), ShieldState::Critical);
        assert_eq!(shield.metrics().store_failures, 1);

        store.set_unavailable(false);
        shield.force_integrity_check(Some("primary")).await.unwrap();
        assert_eq!(shield.state(), ShieldState::Normal);
    }
}
