/*!
 * Shield metrics
 *
 * Lifetime counters for every pipeline stage. Exported with the rest of the
 * shield state and restored on import.
 */

use serde::{Deserialize, Serialize};

/// Aggregate counters of a shield
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldMetrics {
    pub threats_reported: u64,
    pub threats_resolved: u64,
    /// Dropped to respect the registry cap
    pub threats_evicted: u64,
    /// Dropped after the retention window
    pub threats_pruned: u64,

    pub checks_run: u64,
    pub checks_failed: u64,

    pub repairs_attempted: u64,
    pub repairs_succeeded: u64,
    pub repairs_failed: u64,
    pub repairs_deferred: u64,

    pub snapshots_taken: u64,
    pub snapshots_evicted: u64,
    pub rollbacks: u64,
    pub rollbacks_failed: u64,

    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub conflict_write_failures: u64,

    pub quota_warnings: u64,
    pub quota_criticals: u64,
    pub quota_cleanups: u64,

    pub ticks_run: u64,
    /// Ticks skipped because one was already in flight
    pub ticks_skipped: u64,

    /// Store calls that failed or timed out
    pub store_failures: u64,
}

impl ShieldMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share of checks that passed (0.0 - 1.0)
    pub fn check_pass_rate(&self) -> f64 {
        if self.checks_run == 0 {
            1.0
        } else {
            (self.checks_run - self.checks_failed.min(self.checks_run)) as f64
                / self.checks_run as f64
        }
    }

    /// Share of repair attempts that succeeded (0.0 - 1.0)
    pub fn repair_success_rate(&self) -> f64 {
        if self.repairs_attempted == 0 {
            1.0
        } else {
            self.repairs_succeeded as f64 / self.repairs_attempted as f64
        }
    }

    /// Threats that are neither resolved nor dropped
    pub fn outstanding_threats(&self) -> u64 {
        self.threats_reported
            .saturating_sub(self.threats_resolved)
            .saturating_sub(self.threats_evicted)
    }

    /// Format a human-readable summary
    pub fn summary(&self) -> String {
        format!(
            "Threats: {} reported / {} resolved | Checks: {} ({:.1}% pass) | Repairs: {}/{} | Snapshots: {} taken, {} evicted | Conflicts: {}/{} | Ticks: {} run, {} skipped",
            self.threats_reported,
            self.threats_resolved,
            self.checks_run,
            self.check_pass_rate() * 100.0,
            self.repairs_succeeded,
            self.repairs_attempted,
            self.snapshots_taken,
            self.snapshots_evicted,
            self.conflicts_resolved,
            self.conflicts_detected,
            self.ticks_run,
            self.ticks_skipped,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_without_activity() {
        let metrics = ShieldMetrics::new();
        assert_eq!(metrics.check_pass_rate(), 1.0);
        assert_eq!(metrics.repair_success_rate(), 1.0);
    }

    #[test]
    fn test_rates() {
        let metrics = ShieldMetrics {
            checks_run: 10,
            checks_failed: 2,
            repairs_attempted: 4,
            repairs_succeeded: 3,
            ..Default::default()
        };
        assert_eq!(metrics.check_pass_rate(), 0.8);
        assert_eq!(metrics.repair_success_rate(), 0.75);
    }

    #[test]
    fn test_outstanding_threats() {
        let metrics = ShieldMetrics {
            threats_reported: 10,
            threats_resolved: 4,
            threats_evicted: 1,
            ..Default::default()
        };
        assert_eq!(metrics.outstanding_threats(), 5);
    }

    #[test]
    fn test_summary() {
        let metrics = ShieldMetrics {
            threats_reported: 3,
            checks_run: 4,
            checks_failed: 1,
            ticks_run: 2,
            ..Default::default()
        };
        let summary = metrics.summary();
        assert!(summary.contains("Threats: 3 reported"));
        assert!(summary.contains("Checks: 4 (75.0% pass)"));
        assert!(summary.contains("Ticks: 2 run, 0 skipped"));
    }

    #[test]
    fn test_missing_fields_default_on_import() {
        let metrics: ShieldMetrics = serde_json::from_str(r#"{"ticks_run": 7}"#).unwrap();
        assert_eq!(metrics.ticks_run, 7);
        assert_eq!(metrics.checks_run, 0);
    }
}
