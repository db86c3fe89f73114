/*!
 * Monitor scheduler
 *
 * A tick runs the whole pipeline once:
 *
 * 1. Prune expired resolved threats
 * 2. Check every tier whose check interval elapsed, repairing failures
 * 3. Snapshot every healthy tier whose snapshot interval elapsed
 * 4. Evaluate the snapshot quota
 * 5. Recompute the shield state
 *
 * Ticks never overlap: the per-tier timers double as the reentrancy guard,
 * and a tick that finds them taken is skipped. The background loop spawned
 * by [`Shield::start_monitor`] stops only between ticks.
 */

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use vigil_threat::{ShieldState, StateTransition};

use crate::integrity::IntegrityCheckResult;
use crate::quota::QuotaReport;
use crate::repair::{RepairCoordinator, RepairOutcome, Remedy};
use crate::shield::Shield;
use crate::snapshot::SnapshotMeta;

/// When each tier was last checked and snapshotted
#[derive(Debug, Default)]
pub(crate) struct TierTimers {
    last_check: HashMap<String, Instant>,
    last_snapshot: HashMap<String, Instant>,
}

impl TierTimers {
    fn due(last: Option<&Instant>, interval: Duration, now: Instant) -> bool {
        last.map_or(true, |at| now.duration_since(*at) >= interval)
    }

    /// Forget all timing; every tier becomes due
    pub(crate) fn reset(&mut self) {
        self.last_check.clear();
        self.last_snapshot.clear();
    }
}

/// What one tick did
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub started_at: DateTime<Utc>,
    pub pruned: usize,
    pub checks: Vec<IntegrityCheckResult>,
    pub repairs: Vec<RepairOutcome>,
    pub snapshots: Vec<SnapshotMeta>,
    pub quota: Option<QuotaReport>,
    pub transition: Option<StateTransition>,
    pub state: ShieldState,
    pub aggregated_level: u8,
}

impl TickReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            pruned: 0,
            checks: Vec::new(),
            repairs: Vec::new(),
            snapshots: Vec::new(),
            quota: None,
            transition: None,
            state: ShieldState::Normal,
            aggregated_level: 0,
        }
    }

    pub fn failed_checks(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }

    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "State: {} (level {}) | Checks: {} ({} failed) | Repairs: {} | Snapshots: {} | Pruned: {}",
            self.state,
            self.aggregated_level,
            self.checks.len(),
            self.failed_checks(),
            self.repairs.len(),
            self.snapshots.len(),
            self.pruned
        )
    }
}

/// Result of asking for a tick
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Ran(Box<TickReport>),
    /// Another tick was still running
    Skipped,
    /// Monitoring is disabled
    Disabled,
}

impl TickOutcome {
    pub fn report(&self) -> Option<&TickReport> {
        match self {
            TickOutcome::Ran(report) => Some(report),
            _ => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, TickOutcome::Skipped)
    }
}

impl Shield {
    /// Run one tick now, unless disabled or a tick is already running
    pub async fn tick(&self) -> TickOutcome {
        if !self.is_enabled() {
            debug!("Tick ignored: monitoring disabled");
            return TickOutcome::Disabled;
        }

        let Ok(mut timers) = self.inner.timers.try_lock() else {
            self.inner.metrics.lock().ticks_skipped += 1;
            warn!("⏭️  Tick skipped: previous tick still running");
            return TickOutcome::Skipped;
        };

        let report = self.run_tick(&mut timers).await;
        self.inner.metrics.lock().ticks_run += 1;
        debug!("📊 {}", report.summary());
        TickOutcome::Ran(Box::new(report))
    }

    async fn run_tick(&self, timers: &mut TierTimers) -> TickReport {
        let config = self.config();
        let mut report = TickReport::new(Utc::now());

        // 1. retention
        report.pruned = self.inner.threats.lock().prune_expired(Utc::now());
        if report.pruned > 0 {
            self.inner.metrics.lock().threats_pruned += report.pruned as u64;
            debug!("Pruned {} expired threat(s)", report.pruned);
        }

        // 2. checks and repairs; repairs share one budget for the whole tick
        let coordinator = RepairCoordinator::new(config.max_repair_duration());
        let mut budget = coordinator.budget();

        for tier in &config.tiers {
            if !TierTimers::due(
                timers.last_check.get(&tier.name),
                config.check_interval(tier),
                Instant::now(),
            ) {
                continue;
            }

            let result = self.run_check(&tier.name).await;
            let mut deferred = false;

            let repairable = result
                .issues
                .iter()
                .any(|i| Remedy::for_kind(i.kind) != Remedy::Unrepairable);
            if !result.passed && config.auto_repair && repairable {
                let started = Instant::now();
                let outcome = coordinator
                    .attempt(self, &tier.name, &result.issues, started + budget)
                    .await;
                budget = budget.saturating_sub(started.elapsed());
                self.absorb_repair(&outcome);
                deferred = outcome.is_deferred();

                // Verify; the result becomes the tier's latest check. A rollback
                // has already re-checked the tier.
                if !outcome.repaired.is_empty() && !outcome.rolled_back {
                    self.run_check(&tier.name).await;
                }
                report.repairs.push(outcome);
            }

            if !deferred {
                timers.last_check.insert(tier.name.clone(), Instant::now());
            }
            report.checks.push(result);
        }

        // 3. snapshots of tiers known to be healthy
        for tier in &config.tiers {
            if !TierTimers::due(
                timers.last_snapshot.get(&tier.name),
                config.snapshot_interval(tier),
                Instant::now(),
            ) {
                continue;
            }

            if self.last_check(&tier.name).is_some_and(|r| !r.passed) {
                debug!("Snapshot of tier '{}' withheld: tier is unhealthy", tier.name);
                continue;
            }

            if let Some(snapshot) = self.take_snapshot(&tier.name).await {
                timers
                    .last_snapshot
                    .insert(tier.name.clone(), Instant::now());
                report.snapshots.push(snapshot.meta());
            }
        }

        // 4. quota
        report.quota = Some(self.run_quota_check());

        // 5. state
        let transition = self.inner.threats.lock().recompute(Utc::now());
        if let Some(ref transition) = transition {
            self.announce(transition);
        }
        report.transition = transition;

        let status = self.status();
        report.state = status.state;
        report.aggregated_level = status.aggregated_level;
        report
    }

    fn absorb_repair(&self, outcome: &RepairOutcome) {
        let mut metrics = self.inner.metrics.lock();
        metrics.repairs_attempted += 1;
        if outcome.is_repaired() {
            metrics.repairs_succeeded += 1;
        }
        if !outcome.failed.is_empty() {
            metrics.repairs_failed += 1;
        }
        if outcome.is_deferred() {
            metrics.repairs_deferred += 1;
        }
    }

    /// Spawn the periodic tick loop on the current tokio runtime
    pub fn start_monitor(&self) -> MonitorScheduler {
        MonitorScheduler::start(self.clone())
    }
}

/// Handle of the background tick loop
#[derive(Debug)]
pub struct MonitorScheduler {
    shield: Shield,
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorScheduler {
    fn start(shield: Shield) -> Self {
        let period = shield.config().monitoring_interval();
        let (cancel, mut cancelled) = watch::channel(false);
        let worker = shield.clone();

        info!("🛰️  Monitor started | Interval: {:?}", period);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        worker.tick().await;
                    }
                    changed = cancelled.changed() => {
                        if changed.is_err() || *cancelled.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Monitor loop exited");
        });

        Self {
            shield,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn shield(&self) -> &Shield {
        &self.shield
    }

    pub fn enable(&self) {
        self.shield.enable();
    }

    /// Stop future ticks without stopping the loop
    pub fn disable(&self) {
        self.shield.disable();
    }

    pub fn is_enabled(&self) -> bool {
        self.shield.is_enabled()
    }

    /// Whether the loop is still alive
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop after the in-flight tick completes, then release every
    /// event bus subscriber.
    pub async fn shutdown(mut self) {
        let _ = self.cancel.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Monitor loop ended abnormally: {}", e);
            }
        }
        self.shield.inner.bus.clear();
        info!("🛑 Monitor stopped | {}", self.shield.metrics().summary());
    }
}

impl Drop for MonitorScheduler {
    fn drop(&mut self) {
        // Detached loops still stop at the next tick boundary
        let _ = self.cancel.send(true);
    }
}
