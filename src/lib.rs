/*!
 * Vigil - protective monitoring for tiered key/value stores
 *
 * Vigil turns heterogeneous health signals into a single alert state and
 * guards the integrity of its backing store:
 * - Threat aggregation into NORMAL / ELEVATED / HIGH / CRITICAL
 * - Periodic per-tier integrity checks (missing data, schema, orphans, checksums)
 * - Versioned, checksummed snapshots with verified rollback
 * - Automatic repair under a per-tick time budget
 * - Sync conflict detection and resolution with write-back
 * - Snapshot quota governance with cleanup
 *
 * Everything is reached through the [`Shield`] handle. Storage is abstracted
 * behind [`vigil_store::VersionedStore`]; the threat core lives in
 * [`vigil_threat`].
 */

pub mod config;
pub mod conflict;
pub mod error;
pub mod export;
pub mod integrity;
pub mod logging;
pub mod metrics;
pub mod quota;
pub mod repair;
pub mod scheduler;
pub mod shield;
pub mod snapshot;

// Re-export commonly used types
pub use config::{LogConfig, LogLevel, QuotaConfig, ShieldConfig, SyncConfig, TierConfig};
pub use conflict::{ResolutionStrategy, ResolvedConflict, SyncConflict, VersionedRecord};
pub use error::{ErrorCategory, Result, VigilError};
pub use export::ShieldExport;
pub use integrity::{
    ChecksumAlgorithm, CorruptionEvent, CorruptionKind, IntegrityCheckResult, IntegrityIssue,
    SchemaValidator, TierImage, INDEX_KEY,
};
pub use metrics::ShieldMetrics;
pub use quota::{QuotaReport, QuotaStatus};
pub use scheduler::{MonitorScheduler, TickOutcome, TickReport};
pub use shield::Shield;
pub use snapshot::{MemorySnapshot, SnapshotMeta};
pub use vigil_threat::{
    ShieldState, ShieldStatus, StateThresholds, StateTransition, Subscription, ThreatEvent,
    ThreatKind, ThreatReport,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
