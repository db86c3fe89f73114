/*!
 * Corruption events
 *
 * Every failed integrity predicate, quota overrun and sync conflict is
 * recorded as a corruption event linked to the threat it raised. The ledger
 * resolves events when the underlying condition is repaired or disappears.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;
use vigil_threat::ThreatKind;

/// What went wrong with a tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptionKind {
    MissingData,
    InvalidSchema,
    ChecksumMismatch,
    OrphanedData,
    QuotaExceeded,
    SyncConflict,
    /// The tier could not be read in time
    StoreUnavailable,
}

impl CorruptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CorruptionKind::MissingData => "missing_data",
            CorruptionKind::InvalidSchema => "invalid_schema",
            CorruptionKind::ChecksumMismatch => "checksum_mismatch",
            CorruptionKind::OrphanedData => "orphaned_data",
            CorruptionKind::QuotaExceeded => "quota_exceeded",
            CorruptionKind::SyncConflict => "sync_conflict",
            CorruptionKind::StoreUnavailable => "store_unavailable",
        }
    }

    /// Severity reported when the kind is detected by a check
    pub fn default_severity(&self) -> u8 {
        match self {
            CorruptionKind::MissingData => 4,
            CorruptionKind::InvalidSchema => 3,
            CorruptionKind::ChecksumMismatch => 4,
            CorruptionKind::OrphanedData => 2,
            CorruptionKind::QuotaExceeded => 4,
            CorruptionKind::SyncConflict => 3,
            CorruptionKind::StoreUnavailable => 5,
        }
    }

    /// Threat category the kind is reported under
    pub fn threat_kind(&self) -> ThreatKind {
        match self {
            CorruptionKind::MissingData | CorruptionKind::QuotaExceeded => ThreatKind::Memory,
            CorruptionKind::InvalidSchema
            | CorruptionKind::ChecksumMismatch
            | CorruptionKind::OrphanedData
            | CorruptionKind::SyncConflict
            | CorruptionKind::StoreUnavailable => ThreatKind::Integrity,
        }
    }
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded corruption condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorruptionEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tier: String,
    pub kind: CorruptionKind,
    pub severity: u8,
    pub affected_keys: Vec<String>,

    /// Threat raised for this event
    pub threat_id: Uuid,

    /// Threats raised by later checks that still found the condition
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub follow_ups: Vec<Uuid>,

    pub resolved: bool,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CorruptionEvent {
    /// The original threat followed by every follow-up
    pub fn threat_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        std::iter::once(self.threat_id).chain(self.follow_ups.iter().copied())
    }

    fn is_linked_to(&self, threat_id: Uuid) -> bool {
        self.threat_id == threat_id || self.follow_ups.contains(&threat_id)
    }

    fn mark_resolved(&mut self, now: DateTime<Utc>) {
        self.resolved = true;
        self.resolved_at = Some(now);
    }
}

/// Bounded record of corruption events, oldest first
#[derive(Debug, Clone)]
pub struct CorruptionLedger {
    events: VecDeque<CorruptionEvent>,
    limit: usize,
}

impl CorruptionLedger {
    pub fn new(limit: usize) -> Self {
        Self {
            events: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn record(
        &mut self,
        tier: &str,
        kind: CorruptionKind,
        severity: u8,
        affected_keys: Vec<String>,
        threat_id: Uuid,
        now: DateTime<Utc>,
    ) -> CorruptionEvent {
        let event = CorruptionEvent {
            id: Uuid::new_v4(),
            timestamp: now,
            tier: tier.to_string(),
            kind,
            severity,
            affected_keys,
            threat_id,
            follow_ups: Vec::new(),
            resolved: false,
            resolved_at: None,
        };
        self.events.push_back(event.clone());
        self.evict_over_limit();
        event
    }

    /// Attach a threat to the unresolved event of `(tier, kind)`.
    ///
    /// Returns false when no such event is open.
    pub fn follow_up(&mut self, tier: &str, kind: CorruptionKind, threat_id: Uuid) -> bool {
        match self
            .events
            .iter_mut()
            .find(|e| !e.resolved && e.tier == tier && e.kind == kind)
        {
            Some(event) => {
                event.follow_ups.push(threat_id);
                true
            }
            None => false,
        }
    }

    /// Resolve unresolved events of `tier` whose kind passes `filter`.
    ///
    /// Returns every threat id linked to the resolved events.
    pub fn resolve_where<F>(&mut self, tier: &str, now: DateTime<Utc>, filter: F) -> Vec<Uuid>
    where
        F: Fn(CorruptionKind) -> bool,
    {
        let mut ids = Vec::new();
        for event in self
            .events
            .iter_mut()
            .filter(|e| !e.resolved && e.tier == tier && filter(e.kind))
        {
            event.mark_resolved(now);
            ids.extend(event.threat_ids());
        }
        ids
    }

    /// Resolve unresolved events of one kind in `tier`
    pub fn resolve_kind(&mut self, tier: &str, kind: CorruptionKind, now: DateTime<Utc>) -> Vec<Uuid> {
        self.resolve_where(tier, now, |k| k == kind)
    }

    /// Resolve every unresolved event of `tier` raised by a check
    pub fn resolve_check_findings(&mut self, tier: &str, now: DateTime<Utc>) -> Vec<Uuid> {
        self.resolve_where(tier, now, |k| {
            !matches!(k, CorruptionKind::QuotaExceeded | CorruptionKind::SyncConflict)
        })
    }

    /// Resolve unresolved events of `kind` in any tier
    pub fn resolve_kind_everywhere(&mut self, kind: CorruptionKind, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut ids = Vec::new();
        for event in self.events.iter_mut().filter(|e| !e.resolved && e.kind == kind) {
            event.mark_resolved(now);
            ids.extend(event.threat_ids());
        }
        ids
    }

    /// Resolve the event linked to a threat.
    ///
    /// Returns every threat id of that event, or nothing when no open event
    /// carries the threat.
    pub fn resolve_by_threat(&mut self, threat_id: Uuid, now: DateTime<Utc>) -> Vec<Uuid> {
        match self
            .events
            .iter_mut()
            .find(|e| !e.resolved && e.is_linked_to(threat_id))
        {
            Some(event) => {
                event.mark_resolved(now);
                event.threat_ids().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &CorruptionEvent> {
        self.events.iter().filter(|e| !e.resolved)
    }

    pub fn unresolved_for(&self, tier: &str, kind: CorruptionKind) -> usize {
        self.unresolved()
            .filter(|e| e.tier == tier && e.kind == kind)
            .count()
    }

    pub fn events(&self) -> impl Iterator<Item = &CorruptionEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop the oldest resolved events, up to half the ledger.
    ///
    /// Unresolved events still back an active threat and are kept.
    pub fn halve(&mut self) -> usize {
        let before = self.events.len();
        let mut excess = before - before / 2;
        self.events.retain(|e| {
            if excess > 0 && e.resolved {
                excess -= 1;
                false
            } else {
                true
            }
        });
        before - self.events.len()
    }

    fn evict_over_limit(&mut self) {
        while self.events.len() > self.limit {
            self.events.pop_front();
        }
    }
}
