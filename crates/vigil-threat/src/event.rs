//! Threat event schema
//!
//! A threat is a structured, timestamped signal describing a detected risk
//! condition with an ordinal severity from 0 (informational) to 5 (severe).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ThreatError;

/// Highest ordinal severity a threat can carry
pub const MAX_THREAT_LEVEL: u8 = 5;

/// Category of a threat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatKind {
    /// Runtime stability (crashes, restarts, latency spikes)
    Stability,
    /// Behavioural drift reported by decision engines
    Emotional,
    /// Order/execution pipeline problems
    Execution,
    /// Memory and storage pressure, missing data
    Memory,
    /// Data integrity (checksums, schema, conflicts)
    Integrity,
}

impl ThreatKind {
    /// Every kind, in declaration order
    pub const ALL: [ThreatKind; 5] = [
        ThreatKind::Stability,
        ThreatKind::Emotional,
        ThreatKind::Execution,
        ThreatKind::Memory,
        ThreatKind::Integrity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::Stability => "stability",
            ThreatKind::Emotional => "emotional",
            ThreatKind::Execution => "execution",
            ThreatKind::Memory => "memory",
            ThreatKind::Integrity => "integrity",
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreatKind {
    type Err = ThreatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ThreatKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ThreatError::UnknownKind(s.to_string()))
    }
}

/// Parameters of a new threat, before the registry assigns identity and time
#[derive(Debug, Clone, PartialEq)]
pub struct ThreatReport {
    pub kind: ThreatKind,
    pub level: u8,
    pub source: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl ThreatReport {
    /// Create a report with an empty details object.
    ///
    /// Levels above [`MAX_THREAT_LEVEL`] are clamped when the report is recorded.
    pub fn new(
        kind: ThreatKind,
        level: u8,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            level,
            source: source.into(),
            message: message.into(),
            details: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    /// Attach an opaque structured payload
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// A recorded threat
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    /// Globally unique, stable identifier
    pub id: Uuid,

    /// When the threat was reported
    pub timestamp: DateTime<Utc>,

    pub kind: ThreatKind,

    /// Ordinal severity, 0..=5
    pub level: u8,

    /// Free-text reporter identity
    pub source: String,

    pub message: String,

    /// Opaque structured payload supplied by the reporter
    #[serde(default)]
    pub details: serde_json::Value,

    pub resolved: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ThreatEvent {
    pub(crate) fn from_report(report: ThreatReport, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now,
            kind: report.kind,
            level: report.level.min(MAX_THREAT_LEVEL),
            source: report.source,
            message: report.message,
            details: report.details,
            resolved: false,
            resolved_at: None,
        }
    }

    /// Active threats contribute to the aggregated level
    pub fn is_active(&self) -> bool {
        !self.resolved
    }
}
