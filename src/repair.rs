/*!
 * Repair coordination
 *
 * Chooses a remedy per issue kind and executes it through [`RepairActions`].
 * All remedies of a tick share one time budget; once it is spent the
 * remaining remedies are deferred to the next tick.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Result, VigilError};
use crate::integrity::{CorruptionKind, IntegrityIssue};

/// Automatic remedy for an issue kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remedy {
    /// Restore the tier from its most recent snapshot
    Rollback,
    /// Delete keys the index does not list
    PurgeOrphans,
    /// Nothing can be done automatically
    Unrepairable,
}

impl Remedy {
    pub fn for_kind(kind: CorruptionKind) -> Self {
        match kind {
            CorruptionKind::MissingData
            | CorruptionKind::InvalidSchema
            | CorruptionKind::ChecksumMismatch => Remedy::Rollback,
            CorruptionKind::OrphanedData => Remedy::PurgeOrphans,
            CorruptionKind::QuotaExceeded
            | CorruptionKind::SyncConflict
            | CorruptionKind::StoreUnavailable => Remedy::Unrepairable,
        }
    }
}

/// Operations the coordinator needs from its owner
#[async_trait]
pub trait RepairActions: Send + Sync {
    /// Roll `tier` back to its most recent snapshot.
    ///
    /// Returns `Ok(false)` when no usable snapshot exists.
    async fn rollback_latest(&self, tier: &str) -> Result<bool>;

    /// Delete `keys` from `tier`
    async fn purge_keys(&self, tier: &str, keys: &[String]) -> Result<()>;
}

/// What a repair attempt achieved for one tier
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub tier: String,
    pub repaired: Vec<CorruptionKind>,
    pub failed: Vec<CorruptionKind>,

    /// Left for the next tick because the budget ran out
    pub deferred: Vec<CorruptionKind>,

    /// Number of remedies executed
    pub attempts: u32,

    /// The tier was restored from a snapshot, which re-checks it
    #[serde(default)]
    pub rolled_back: bool,

    /// Why remedies failed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RepairOutcome {
    fn new(tier: &str) -> Self {
        Self {
            tier: tier.to_string(),
            ..Default::default()
        }
    }

    /// Every issue was repaired
    pub fn is_repaired(&self) -> bool {
        self.failed.is_empty() && self.deferred.is_empty()
    }

    fn fail(&mut self, kinds: impl IntoIterator<Item = CorruptionKind>, reason: String) {
        let error = VigilError::Repair {
            tier: self.tier.clone(),
            reason,
        };
        warn!("⚠️  {}", error);
        self.failed.extend(kinds);
        self.errors.push(error.to_string());
    }

    pub fn is_deferred(&self) -> bool {
        !self.deferred.is_empty()
    }
}

/// Repair policy with a per-tick time budget
#[derive(Debug, Clone)]
pub struct RepairCoordinator {
    budget: Duration,
}

impl RepairCoordinator {
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Deadline for a repair cycle starting now
    pub fn start_cycle(&self) -> Instant {
        Instant::now() + self.budget
    }

    /// Attempt remedies for `issues` of `tier` before `deadline`
    pub async fn attempt(
        &self,
        actions: &dyn RepairActions,
        tier: &str,
        issues: &[IntegrityIssue],
        deadline: Instant,
    ) -> RepairOutcome {
        let mut outcome = RepairOutcome::new(tier);

        let mut rollback_kinds = BTreeSet::new();
        let mut orphans = BTreeSet::new();
        let mut orphan_kinds = false;
        for issue in issues {
            match Remedy::for_kind(issue.kind) {
                Remedy::Rollback => {
                    rollback_kinds.insert(issue.kind);
                }
                Remedy::PurgeOrphans => {
                    orphan_kinds = true;
                    orphans.extend(issue.affected_keys.iter().cloned());
                }
                Remedy::Unrepairable => outcome.failed.push(issue.kind),
            }
        }

        if !rollback_kinds.is_empty() {
            if Instant::now() >= deadline {
                outcome.deferred.extend(rollback_kinds.iter().copied());
            } else {
                outcome.attempts += 1;
                match tokio::time::timeout_at(deadline, actions.rollback_latest(tier)).await {
                    Ok(Ok(true)) => {
                        info!("🔧 Rolled back tier '{}' to its latest snapshot", tier);
                        outcome.rolled_back = true;
                        outcome.repaired.extend(rollback_kinds.iter().copied());
                    }
                    Ok(Ok(false)) => {
                        outcome.fail(
                            rollback_kinds.iter().copied(),
                            "no usable snapshot to roll back to".to_string(),
                        );
                    }
                    Ok(Err(e)) => {
                        outcome.fail(rollback_kinds.iter().copied(), format!("rollback: {}", e));
                    }
                    Err(_) => {
                        warn!("⏱️  Repair budget exhausted during rollback of '{}'", tier);
                        outcome.deferred.extend(rollback_kinds.iter().copied());
                    }
                }
            }
        }

        if orphan_kinds {
            if outcome.rolled_back {
                // The restored image replaced the orphans
                outcome.repaired.push(CorruptionKind::OrphanedData);
            } else if Instant::now() >= deadline {
                outcome.deferred.push(CorruptionKind::OrphanedData);
            } else {
                outcome.attempts += 1;
                let keys: Vec<String> = orphans.into_iter().collect();
                match tokio::time::timeout_at(deadline, actions.purge_keys(tier, &keys)).await {
                    Ok(Ok(())) => {
                        info!("🧹 Purged {} orphaned key(s) from tier '{}'", keys.len(), tier);
                        outcome.repaired.push(CorruptionKind::OrphanedData);
                    }
                    Ok(Err(e)) => {
                        outcome.fail(
                            [CorruptionKind::OrphanedData],
                            format!("orphan cleanup: {}", e),
                        );
                    }
                    Err(_) => {
                        warn!("⏱️  Repair budget exhausted during cleanup of '{}'", tier);
                        outcome.deferred.push(CorruptionKind::OrphanedData);
                    }
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VigilError;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        has_snapshot: bool,
        fail_purge: bool,
        delay: Option<Duration>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RepairActions for Recorder {
        async fn rollback_latest(&self, tier: &str) -> Result<bool> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.calls.lock().push(format!("rollback:{}", tier));
            Ok(self.has_snapshot)
        }

        async fn purge_keys(&self, tier: &str, keys: &[String]) -> Result<()> {
            self.calls
                .lock()
                .push(format!("purge:{}:{}", tier, keys.join(",")));
            if self.fail_purge {
                return Err(VigilError::Repair {
                    tier: tier.to_string(),
                    reason: "read-only".to_string(),
                });
            }
            Ok(())
        }
    }

    fn issue(kind: CorruptionKind, keys: &[&str]) -> IntegrityIssue {
        IntegrityIssue::new(kind, "test", keys.iter().map(|k| k.to_string()).collect())
    }

    fn coordinator() -> RepairCoordinator {
        RepairCoordinator::new(Duration::from_secs(5))
    }

    #[test]
    fn test_remedy_table() {
        assert_eq!(Remedy::for_kind(CorruptionKind::MissingData), Remedy::Rollback);
        assert_eq!(Remedy::for_kind(CorruptionKind::InvalidSchema), Remedy::Rollback);
        assert_eq!(Remedy::for_kind(CorruptionKind::ChecksumMismatch), Remedy::Rollback);
        assert_eq!(Remedy::for_kind(CorruptionKind::OrphanedData), Remedy::PurgeOrphans);
        assert_eq!(Remedy::for_kind(CorruptionKind::QuotaExceeded), Remedy::Unrepairable);
        assert_eq!(Remedy::for_kind(CorruptionKind::StoreUnavailable), Remedy::Unrepairable);
    }

    #[tokio::test]
    async fn test_single_rollback_for_several_issues() {
        let actions = Recorder {
            has_snapshot: true,
            ..Default::default()
        };
        let c = coordinator();
        let issues = [
            issue(CorruptionKind::MissingData, &["a"]),
            issue(CorruptionKind::ChecksumMismatch, &[]),
        ];

        let outcome = c.attempt(&actions, "primary", &issues, c.start_cycle()).await;
        assert!(outcome.is_repaired());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(*actions.calls.lock(), vec!["rollback:primary"]);
    }

    #[tokio::test]
    async fn test_rollback_without_snapshot_fails() {
        let actions = Recorder::default();
        let c = coordinator();
        let issues = [issue(CorruptionKind::MissingData, &[])];

        let outcome = c.attempt(&actions, "primary", &issues, c.start_cycle()).await;
        assert!(!outcome.is_repaired());
        assert!(!outcome.rolled_back);
        assert_eq!(outcome.failed, vec![CorruptionKind::MissingData]);
        assert_eq!(
            outcome.errors,
            vec!["Repair failed for tier 'primary': no usable snapshot to roll back to"]
        );
    }

    #[tokio::test]
    async fn test_orphans_purged() {
        let actions = Recorder::default();
        let c = coordinator();
        let issues = [issue(CorruptionKind::OrphanedData, &["y", "x"])];

        let outcome = c.attempt(&actions, "primary", &issues, c.start_cycle()).await;
        assert!(outcome.is_repaired());
        assert_eq!(*actions.calls.lock(), vec!["purge:primary:x,y"]);
    }

    #[tokio::test]
    async fn test_rollback_supersedes_purge() {
        let actions = Recorder {
            has_snapshot: true,
            ..Default::default()
        };
        let c = coordinator();
        let issues = [
            issue(CorruptionKind::InvalidSchema, &["a"]),
            issue(CorruptionKind::OrphanedData, &["b"]),
        ];

        let outcome = c.attempt(&actions, "primary", &issues, c.start_cycle()).await;
        assert!(outcome.is_repaired());
        assert!(outcome.rolled_back);
        assert_eq!(outcome.repaired.len(), 2);
        assert_eq!(*actions.calls.lock(), vec!["rollback:primary"]);
    }

    #[tokio::test]
    async fn test_failed_purge_and_unrepairable() {
        let actions = Recorder {
            fail_purge: true,
            ..Default::default()
        };
        let c = coordinator();
        let issues = [
            issue(CorruptionKind::OrphanedData, &["b"]),
            issue(CorruptionKind::StoreUnavailable, &[]),
        ];

        let outcome = c.attempt(&actions, "primary", &issues, c.start_cycle()).await;
        assert_eq!(
            outcome.failed,
            vec![CorruptionKind::StoreUnavailable, CorruptionKind::OrphanedData]
        );
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("orphan cleanup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhaustion_defers() {
        let actions = Recorder {
            has_snapshot: true,
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let c = RepairCoordinator::new(Duration::from_secs(1));
        let issues = [
            issue(CorruptionKind::ChecksumMismatch, &[]),
            issue(CorruptionKind::OrphanedData, &["z"]),
        ];

        let outcome = c.attempt(&actions, "primary", &issues, c.start_cycle()).await;
        assert!(outcome.is_deferred());
        assert_eq!(
            outcome.deferred,
            vec![CorruptionKind::ChecksumMismatch, CorruptionKind::OrphanedData]
        );
        assert!(actions.calls.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spent_budget_defers_everything() {
        let actions = Recorder::default();
        let c = RepairCoordinator::new(Duration::from_millis(10));
        let deadline = c.start_cycle();
        tokio::time::advance(Duration::from_millis(20)).await;

        let issues = [issue(CorruptionKind::MissingData, &[])];
        let outcome = c.attempt(&actions, "primary", &issues, deadline).await;
        assert_eq!(outcome.deferred, vec![CorruptionKind::MissingData]);
        assert_eq!(outcome.attempts, 0);
    }
}
