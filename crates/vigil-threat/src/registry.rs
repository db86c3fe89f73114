//! Threat Registry: bounded log of threat events
//!
//! The registry owns every reported threat. It enforces a maximum number of
//! retained events (oldest first out, resolved or not), drops resolved events
//! once they age past the retention window, and computes the aggregated
//! threat level of the active set.
//!
//! # Aggregation
//!
//! ```text
//! aggregated = clamp(0, 100, round(Σ level_i × 20 / count_active))
//! ```
//!
//! With no active threats the aggregated level is 0. The value is a pure
//! function of the active set, so recomputing it never changes anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ThreatError;
use crate::event::{ThreatEvent, ThreatKind, ThreatReport};

/// Weight applied to each severity step when aggregating
const LEVEL_WEIGHT: u64 = 20;

/// Upper bound of the aggregated level
const MAX_AGGREGATED_LEVEL: u64 = 100;

/// Capacity and retention settings for the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Maximum number of retained events
    pub max_threats: usize,

    /// How long a resolved event is kept, measured from when it was reported
    pub retention: Duration,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            max_threats: 1000,
            retention: Duration::from_secs(3600),
        }
    }
}

impl RegistryLimits {
    pub fn validate(&self) -> Result<(), ThreatError> {
        if self.max_threats == 0 {
            return Err(ThreatError::InvalidLimits(
                "max_threats must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Lifetime counters of the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub reported: u64,
    pub resolved: u64,
    pub evicted: u64,
    pub pruned: u64,
}

/// Owns the set of threat events
#[derive(Debug)]
pub struct ThreatRegistry {
    events: VecDeque<ThreatEvent>,
    limits: RegistryLimits,
    stats: RegistryStats,
}

impl ThreatRegistry {
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            events: VecDeque::with_capacity(limits.max_threats.min(1024)),
            limits,
            stats: RegistryStats::default(),
        }
    }

    /// Record a new threat.
    ///
    /// Returns the recorded event and, when the cap was exceeded, the oldest
    /// event that was evicted to make room.
    pub fn report(
        &mut self,
        report: ThreatReport,
        now: DateTime<Utc>,
    ) -> (ThreatEvent, Option<ThreatEvent>) {
        let event = ThreatEvent::from_report(report, now);
        self.stats.reported += 1;
        self.events.push_back(event.clone());

        let evicted = if self.events.len() > self.limits.max_threats {
            self.stats.evicted += 1;
            self.events.pop_front()
        } else {
            None
        };

        (event, evicted)
    }

    /// Mark a threat resolved.
    ///
    /// Returns the updated event, or `None` when the id is unknown or the
    /// threat was already resolved.
    pub fn resolve(&mut self, id: Uuid, now: DateTime<Utc>) -> Option<ThreatEvent> {
        let event = self
            .events
            .iter_mut()
            .find(|e| e.id == id && e.is_active())?;
        event.resolved = true;
        event.resolved_at = Some(now);
        self.stats.resolved += 1;
        Some(event.clone())
    }

    /// Remove resolved events older than the retention window.
    ///
    /// Returns the number of removed events.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.limits.retention)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let before = self.events.len();
        self.events
            .retain(|e| e.is_active() || now.signed_duration_since(e.timestamp) <= retention);
        let removed = before - self.events.len();
        self.stats.pruned += removed as u64;
        removed
    }

    /// Aggregated threat level of the active set (0-100)
    pub fn aggregated_level(&self) -> u8 {
        let (sum, count) = self
            .active()
            .fold((0u64, 0u64), |(sum, count), e| {
                (sum + u64::from(e.level) * LEVEL_WEIGHT, count + 1)
            });
        if count == 0 {
            return 0;
        }
        let rounded = (sum + count / 2) / count;
        rounded.min(MAX_AGGREGATED_LEVEL) as u8
    }

    pub fn get(&self, id: Uuid) -> Option<&ThreatEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// All retained events, oldest first
    pub fn events(&self) -> impl Iterator<Item = &ThreatEvent> {
        self.events.iter()
    }

    pub fn active(&self) -> impl Iterator<Item = &ThreatEvent> {
        self.events.iter().filter(|e| e.is_active())
    }

    pub fn by_kind(&self, kind: ThreatKind) -> impl Iterator<Item = &ThreatEvent> {
        self.events.iter().filter(move |e| e.kind == kind)
    }

    pub fn by_level(&self, level: u8) -> impl Iterator<Item = &ThreatEvent> {
        self.events.iter().filter(move |e| e.level == level)
    }

    /// Whether any active threat of `kind` exists
    pub fn is_kind_active(&self, kind: ThreatKind) -> bool {
        self.active().any(|e| e.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        self.stats
    }

    pub fn limits(&self) -> RegistryLimits {
        self.limits
    }

    /// Apply new limits, evicting the oldest events if the cap shrank.
    ///
    /// Returns the evicted events.
    pub fn set_limits(&mut self, limits: RegistryLimits) -> Vec<ThreatEvent> {
        self.limits = limits;
        let mut evicted = Vec::new();
        while self.events.len() > self.limits.max_threats {
            if let Some(e) = self.events.pop_front() {
                self.stats.evicted += 1;
                evicted.push(e);
            }
        }
        evicted
    }

    /// Drop resolved events, oldest first, until at most `keep` events remain
    /// or no resolved event is left. Returns the number removed.
    pub fn trim_resolved(&mut self, keep: usize) -> usize {
        let mut removed = 0;
        while self.events.len() > keep {
            match self.events.iter().position(|e| !e.is_active()) {
                Some(idx) => {
                    self.events.remove(idx);
                    removed += 1;
                }
                None => break,
            }
        }
        self.stats.pruned += removed as u64;
        removed
    }
}

impl Default for ThreatRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}
