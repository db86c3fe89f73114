/*!
 * Configuration types for Vigil
 */

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use vigil_threat::{RegistryLimits, StateThresholds};

use crate::conflict::ResolutionStrategy;
use crate::error::{Result, VigilError};
use crate::integrity::ChecksumAlgorithm;

/// Main configuration of the shield
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShieldConfig {
    /// Whether the scheduler runs ticks
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Attempt remedies for failed checks during a tick
    #[serde(default = "default_true")]
    pub auto_repair: bool,

    /// Scheduler tick period in milliseconds
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval_ms: u64,

    /// Default period between snapshots of a tier
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_ms: u64,

    /// Default period between integrity checks of a tier
    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Snapshots retained per tier
    #[serde(default = "default_max_snapshots")]
    pub max_snapshots: usize,

    /// How long resolved threats are kept
    #[serde(default = "default_threat_retention")]
    pub threat_retention_ms: u64,

    /// Maximum number of retained threat events
    #[serde(default = "default_max_threats")]
    pub max_threats: usize,

    /// Partitions of the backing store
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,

    /// Digest used for snapshot and tier checksums
    #[serde(default)]
    pub checksum: ChecksumAlgorithm,

    /// Alert state cutoffs
    #[serde(default)]
    pub thresholds: StateThresholds,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub quota: QuotaConfig,

    /// Repair time budget per tick
    #[serde(default = "default_max_repair_duration")]
    pub max_repair_duration_ms: u64,

    /// Bound on every backing store call
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Length of the check, corruption and transition histories
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    #[serde(default)]
    pub logging: LogConfig,
}

/// A named partition of the backing store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    pub name: String,

    /// Live size above which the tier reports quota_exceeded
    pub max_size_bytes: u64,

    /// Overrides `check_interval_ms` for this tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_interval_ms: Option<u64>,

    /// Overrides `snapshot_interval_ms` for this tier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_interval_ms: Option<u64>,
}

impl TierConfig {
    pub fn new(name: impl Into<String>, max_size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            max_size_bytes,
            check_interval_ms: None,
            snapshot_interval_ms: None,
        }
    }
}

/// Conflict resolution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Strategy used when a caller does not name one
    pub default_strategy: ResolutionStrategy,

    /// Write attempts made when applying a resolution
    pub max_retries: u32,

    /// Delay between write attempts
    pub retry_delay_ms: u64,
}

impl SyncConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_strategy: ResolutionStrategy::Newest,
            max_retries: 3,
            retry_delay_ms: 100,
        }
    }
}

/// Snapshot storage budget settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Usage percentage that raises a warning threat
    pub warning_threshold: f64,

    /// Usage percentage that raises a critical threat and triggers cleanup
    pub critical_threshold: f64,

    /// Delete old snapshots when usage is critical
    pub auto_cleanup: bool,

    /// Total bytes available to snapshots (defaults to the sum of tier sizes)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_bytes: Option<u64>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 80.0,
            critical_threshold: 95.0,
            auto_cleanup: true,
            budget_bytes: None,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,

    /// Write JSON lines to this file instead of stdout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<std::path::PathBuf>,

    /// JSON formatting on stdout
    pub json: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_repair: true,
            monitoring_interval_ms: default_monitoring_interval(),
            snapshot_interval_ms: default_snapshot_interval(),
            check_interval_ms: default_check_interval(),
            max_snapshots: default_max_snapshots(),
            threat_retention_ms: default_threat_retention(),
            max_threats: default_max_threats(),
            tiers: default_tiers(),
            checksum: ChecksumAlgorithm::default(),
            thresholds: StateThresholds::default(),
            sync: SyncConfig::default(),
            quota: QuotaConfig::default(),
            max_repair_duration_ms: default_max_repair_duration(),
            store_timeout_ms: default_store_timeout(),
            history_limit: default_history_limit(),
            logging: LogConfig::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_monitoring_interval() -> u64 {
    5_000
}

fn default_snapshot_interval() -> u64 {
    60_000
}

fn default_check_interval() -> u64 {
    30_000
}

fn default_max_snapshots() -> usize {
    10
}

fn default_threat_retention() -> u64 {
    3_600_000
}

fn default_max_threats() -> usize {
    1000
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig::new("primary", 10 * 1024 * 1024),
        TierConfig::new("secondary", 50 * 1024 * 1024),
        TierConfig::new("tertiary", 100 * 1024 * 1024),
    ]
}

fn default_max_repair_duration() -> u64 {
    5_000
}

fn default_store_timeout() -> u64 {
    2_000
}

fn default_history_limit() -> usize {
    100
}

impl ShieldConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| VigilError::Config(format!("TOML parse error: {}", e)))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml_string()?)?;
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| VigilError::Serialization(format!("TOML encode error: {}", e)))
    }

    /// Short intervals and low cutoffs for sensitive deployments
    pub fn strict_preset() -> Self {
        Self {
            monitoring_interval_ms: 1_000,
            snapshot_interval_ms: 15_000,
            check_interval_ms: 5_000,
            max_snapshots: 20,
            thresholds: StateThresholds {
                elevated: 15,
                high: 35,
                critical: 60,
                hysteresis: 0,
            },
            quota: QuotaConfig {
                warning_threshold: 70.0,
                critical_threshold: 90.0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Long intervals and damped downgrades for noisy environments
    pub fn relaxed_preset() -> Self {
        Self {
            monitoring_interval_ms: 15_000,
            snapshot_interval_ms: 300_000,
            check_interval_ms: 120_000,
            max_snapshots: 5,
            thresholds: StateThresholds {
                hysteresis: 5,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate the configuration
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        self.registry_limits().validate()?;

        let intervals = [
            ("monitoring_interval_ms", self.monitoring_interval_ms),
            ("snapshot_interval_ms", self.snapshot_interval_ms),
            ("check_interval_ms", self.check_interval_ms),
            ("threat_retention_ms", self.threat_retention_ms),
            ("max_repair_duration_ms", self.max_repair_duration_ms),
            ("store_timeout_ms", self.store_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(VigilError::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.max_snapshots == 0 {
            return Err(VigilError::Config(
                "max_snapshots must be at least 1".to_string(),
            ));
        }

        if self.history_limit == 0 {
            return Err(VigilError::Config(
                "history_limit must be at least 1".to_string(),
            ));
        }

        if self.tiers.is_empty() {
            return Err(VigilError::Config(
                "at least one tier must be configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for tier in &self.tiers {
            if tier.name.trim().is_empty() {
                return Err(VigilError::Config("tier name must not be empty".to_string()));
            }
            if !names.insert(tier.name.as_str()) {
                return Err(VigilError::Config(format!(
                    "duplicate tier name '{}'",
                    tier.name
                )));
            }
            if tier.max_size_bytes == 0 {
                return Err(VigilError::Config(format!(
                    "tier '{}' max_size_bytes must be greater than 0",
                    tier.name
                )));
            }
            if tier.check_interval_ms == Some(0) || tier.snapshot_interval_ms == Some(0) {
                return Err(VigilError::Config(format!(
                    "tier '{}' intervals must be greater than 0",
                    tier.name
                )));
            }
        }

        let quota = &self.quota;
        let in_range = |v: f64| v > 0.0 && v <= 100.0;
        if !in_range(quota.warning_threshold) || !in_range(quota.critical_threshold) {
            return Err(VigilError::Config(
                "quota thresholds must lie within (0, 100]".to_string(),
            ));
        }
        if quota.warning_threshold >= quota.critical_threshold {
            return Err(VigilError::Config(format!(
                "quota warning threshold {} must be below critical threshold {}",
                quota.warning_threshold, quota.critical_threshold
            )));
        }
        if quota.budget_bytes == Some(0) {
            return Err(VigilError::Config(
                "quota budget_bytes must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.iter().find(|t| t.name == name)
    }

    pub fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.name.clone()).collect()
    }

    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            max_threats: self.max_threats,
            retention: Duration::from_millis(self.threat_retention_ms),
        }
    }

    /// Snapshot budget: explicit, or the sum of tier capacities
    pub fn quota_budget_bytes(&self) -> u64 {
        self.quota
            .budget_bytes
            .unwrap_or_else(|| self.tiers.iter().map(|t| t.max_size_bytes).sum())
    }

    pub fn monitoring_interval(&self) -> Duration {
        Duration::from_millis(self.monitoring_interval_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn max_repair_duration(&self) -> Duration {
        Duration::from_millis(self.max_repair_duration_ms)
    }

    /// Effective check period of a tier
    pub fn check_interval(&self, tier: &TierConfig) -> Duration {
        Duration::from_millis(tier.check_interval_ms.unwrap_or(self.check_interval_ms))
    }

    /// Effective snapshot period of a tier
    pub fn snapshot_interval(&self, tier: &TierConfig) -> Duration {
        Duration::from_millis(
            tier.snapshot_interval_ms
                .unwrap_or(self.snapshot_interval_ms),
        )
    }
}
