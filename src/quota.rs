/*!
 * Quota governance
 *
 * Tracks bytes held by retained snapshots against the snapshot budget and
 * the live size of each tier against its own capacity.
 *
 * ```text
 *   usage = used_bytes / budget_bytes × 100
 *
 *   0 ────────────── warning ────────── critical ──── 100
 *        OK          │  WARNING (3)     │ CRITICAL (5), cleanup
 * ```
 *
 * Cleanup removes the oldest ceil(50%) of snapshots across all tiers.
 */

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::QuotaConfig;

/// Pseudo-tier name under which budget-wide quota events are recorded
pub const BUDGET_SCOPE: &str = "*";

/// Severity of a warning-level quota threat
pub const WARNING_SEVERITY: u8 = 3;

/// Severity of a critical-level quota threat
pub const CRITICAL_SEVERITY: u8 = 5;

/// Classification of the usage percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    Ok,
    Warning,
    Critical,
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaStatus::Ok => write!(f, "ok"),
            QuotaStatus::Warning => write!(f, "warning"),
            QuotaStatus::Critical => write!(f, "critical"),
        }
    }
}

/// Live size of a tier that exceeds its capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierOverrun {
    pub tier: String,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
}

/// Result of one quota check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaReport {
    pub usage_percent: f64,
    pub used_bytes: u64,
    pub budget_bytes: u64,
    pub status: QuotaStatus,

    /// Snapshots deleted by cleanup
    pub snapshots_removed: usize,

    /// Snapshot count before cleanup
    pub snapshots_before: usize,

    pub tier_overruns: Vec<TierOverrun>,
}

/// Evaluates usage against the configured thresholds
#[derive(Debug, Clone)]
pub struct QuotaGovernor {
    config: QuotaConfig,
    budget_bytes: u64,
    last: Option<QuotaReport>,
}

impl QuotaGovernor {
    pub fn new(config: QuotaConfig, budget_bytes: u64) -> Self {
        Self {
            config,
            budget_bytes: budget_bytes.max(1),
            last: None,
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    pub fn usage_percent(&self, used_bytes: u64) -> f64 {
        used_bytes as f64 / self.budget_bytes as f64 * 100.0
    }

    pub fn classify(&self, usage_percent: f64) -> QuotaStatus {
        if usage_percent >= self.config.critical_threshold {
            QuotaStatus::Critical
        } else if usage_percent >= self.config.warning_threshold {
            QuotaStatus::Warning
        } else {
            QuotaStatus::Ok
        }
    }

    /// Snapshots to delete for a cleanup: ceil(50%)
    pub fn cleanup_count(snapshot_count: usize) -> usize {
        snapshot_count.div_ceil(2)
    }

    /// Whether a critical usage should trigger cleanup
    pub fn should_clean(&self, status: QuotaStatus) -> bool {
        status == QuotaStatus::Critical && self.config.auto_cleanup
    }

    /// Tiers whose live size exceeds their capacity
    pub fn tier_overruns<'a, I>(&self, tiers: I) -> Vec<TierOverrun>
    where
        I: IntoIterator<Item = (&'a str, u64, u64)>,
    {
        tiers
            .into_iter()
            .filter(|(_, size, max)| size > max)
            .map(|(tier, size_bytes, max_size_bytes)| TierOverrun {
                tier: tier.to_string(),
                size_bytes,
                max_size_bytes,
            })
            .collect()
    }

    pub fn record(&mut self, report: QuotaReport) {
        self.last = Some(report);
    }

    pub fn last_report(&self) -> Option<&QuotaReport> {
        self.last.as_ref()
    }

    /// Usage seen by the most recent check
    pub fn last_usage(&self) -> f64 {
        self.last.as_ref().map(|r| r.usage_percent).unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor(budget: u64) -> QuotaGovernor {
        QuotaGovernor::new(QuotaConfig::default(), budget)
    }

    #[test]
    fn test_classification() {
        let g = governor(1000);
        assert_eq!(g.classify(g.usage_percent(500)), QuotaStatus::Ok);
        assert_eq!(g.classify(g.usage_percent(800)), QuotaStatus::Warning);
        assert_eq!(g.classify(g.usage_percent(949)), QuotaStatus::Warning);
        assert_eq!(g.classify(g.usage_percent(950)), QuotaStatus::Critical);
        assert_eq!(g.classify(g.usage_percent(5000)), QuotaStatus::Critical);
    }

    #[test]
    fn test_cleanup_count_is_ceil_half() {
        assert_eq!(QuotaGovernor::cleanup_count(0), 0);
        assert_eq!(QuotaGovernor::cleanup_count(1), 1);
        assert_eq!(QuotaGovernor::cleanup_count(5), 3);
        assert_eq!(QuotaGovernor::cleanup_count(10), 5);
    }

    #[test]
    fn test_cleanup_requires_flag() {
        let g = governor(100);
        assert!(g.should_clean(QuotaStatus::Critical));
        assert!(!g.should_clean(QuotaStatus::Warning));

        let manual = QuotaGovernor::new(
            QuotaConfig {
                auto_cleanup: false,
                ..Default::default()
            },
            100,
        );
        assert!(!manual.should_clean(QuotaStatus::Critical));
    }

    #[test]
    fn test_tier_overruns() {
        let g = governor(100);
        let overruns = g.tier_overruns([("primary", 120, 100), ("secondary", 50, 100)]);
        assert_eq!(overruns.len(), 1);
        assert_eq!(overruns[0].tier, "primary");
    }

    #[test]
    fn test_zero_budget_does_not_divide_by_zero() {
        let g = governor(0);
        assert!(g.usage_percent(0).is_finite());
        assert_eq!(g.last_usage(), 0.0);
    }
}
