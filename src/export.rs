/*!
 * Export and import of shield state
 *
 * An export is a JSON document holding the configuration, the threat log,
 * snapshot metadata (no payloads), the corruption ledger, pending conflicts
 * and the metric counters. Import restores configuration and counters only;
 * live timers restart on the next tick.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use vigil_threat::{StateTransition, ThreatEvent};

use crate::config::ShieldConfig;
use crate::conflict::SyncConflict;
use crate::error::{Result, VigilError};
use crate::integrity::CorruptionEvent;
use crate::metrics::ShieldMetrics;
use crate::shield::Shield;
use crate::snapshot::SnapshotMeta;

/// Version of the export document layout
pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShieldExport {
    pub format_version: u32,
    pub exported_at: DateTime<Utc>,
    pub config: ShieldConfig,

    #[serde(default)]
    pub threats: Vec<ThreatEvent>,

    #[serde(default)]
    pub transitions: Vec<StateTransition>,

    #[serde(default)]
    pub snapshots: Vec<SnapshotMeta>,

    #[serde(default)]
    pub corruption_events: Vec<CorruptionEvent>,

    #[serde(default)]
    pub pending_conflicts: Vec<SyncConflict>,

    #[serde(default)]
    pub metrics: ShieldMetrics,
}

impl ShieldExport {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let export: ShieldExport = serde_json::from_str(json)?;
        if export.format_version > EXPORT_FORMAT_VERSION {
            return Err(VigilError::Serialization(format!(
                "export format {} is newer than supported format {}",
                export.format_version, EXPORT_FORMAT_VERSION
            )));
        }
        Ok(export)
    }
}

impl Shield {
    /// Capture the exportable state
    pub fn export(&self) -> ShieldExport {
        ShieldExport {
            format_version: EXPORT_FORMAT_VERSION,
            exported_at: Utc::now(),
            config: self.config(),
            threats: self.threats(),
            transitions: self.transitions(),
            snapshots: self.all_snapshots(),
            corruption_events: self.corruption_events(),
            pending_conflicts: self.pending_conflicts(),
            metrics: self.metrics(),
        }
    }

    pub fn export_json(&self) -> Result<String> {
        self.export().to_json()
    }

    /// Apply the configuration and counters of an export
    pub async fn import(&self, export: ShieldExport) -> Result<()> {
        self.reconfigure(export.config).await?;
        *self.inner.metrics.lock() = export.metrics;
        info!(
            "📥 Imported shield state exported at {} ({} threats on record)",
            export.exported_at,
            export.threats.len()
        );
        Ok(())
    }

    pub async fn import_json(&self, json: &str) -> Result<()> {
        self.import(ShieldExport::from_json(json)?).await
    }
}
