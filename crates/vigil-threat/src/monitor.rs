//! Threat Monitor: registry and state machine under one owner
//!
//! Every mutation of the registry is followed by a state recompute before the
//! call returns, so a status read never observes a level that disagrees with
//! the state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::event::{ThreatEvent, ThreatKind, ThreatReport};
use crate::registry::{RegistryLimits, RegistryStats, ThreatRegistry};
use crate::state::{ShieldState, ShieldStateMachine, StateThresholds, StateTransition};

/// Point-in-time view of the shield
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShieldStatus {
    pub state: ShieldState,

    /// Aggregated threat level, 0-100
    pub aggregated_level: u8,

    /// Ids of unresolved threats
    pub active_threats: BTreeSet<Uuid>,

    /// Whether each kind currently has an active threat
    pub per_kind_activation: BTreeMap<ThreatKind, bool>,

    /// Time of the last recompute
    pub last_check: DateTime<Utc>,
}

/// Result of recording a threat
#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub event: ThreatEvent,

    /// Oldest event dropped to respect the registry cap
    pub evicted: Option<ThreatEvent>,

    pub transition: Option<StateTransition>,
}

/// Result of resolving a threat
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub event: ThreatEvent,
    pub transition: Option<StateTransition>,
}

#[derive(Debug)]
pub struct ThreatMonitor {
    registry: ThreatRegistry,
    machine: ShieldStateMachine,
    last_check: DateTime<Utc>,
}

impl ThreatMonitor {
    pub fn new(
        limits: RegistryLimits,
        thresholds: StateThresholds,
        history_limit: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            registry: ThreatRegistry::new(limits),
            machine: ShieldStateMachine::new(thresholds, history_limit, now),
            last_check: now,
        }
    }

    /// Default limits, thresholds 25/50/75 and a 100-entry transition history
    pub fn with_defaults(now: DateTime<Utc>) -> Self {
        Self::new(
            RegistryLimits::default(),
            StateThresholds::default(),
            100,
            now,
        )
    }

    pub fn report(&mut self, report: ThreatReport, now: DateTime<Utc>) -> ReportOutcome {
        let (event, evicted) = self.registry.report(report, now);
        let transition = self.recompute(now);
        ReportOutcome {
            event,
            evicted,
            transition,
        }
    }

    /// Resolve a threat; `None` when unknown or already resolved
    pub fn resolve(&mut self, id: Uuid, now: DateTime<Utc>) -> Option<ResolveOutcome> {
        let event = self.registry.resolve(id, now)?;
        let transition = self.recompute(now);
        Some(ResolveOutcome { event, transition })
    }

    /// Resolve several threats with a single recompute at the end.
    ///
    /// Returns the events that were actually resolved.
    pub fn resolve_many(
        &mut self,
        ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> (Vec<ThreatEvent>, Option<StateTransition>) {
        let resolved: Vec<ThreatEvent> = ids
            .iter()
            .filter_map(|id| self.registry.resolve(*id, now))
            .collect();
        let transition = if resolved.is_empty() {
            None
        } else {
            self.recompute(now)
        };
        (resolved, transition)
    }

    /// Drop expired resolved events. Resolved events carry no weight, so the
    /// state does not change.
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        self.registry.prune_expired(now)
    }

    /// Re-derive the state from the current active set
    pub fn recompute(&mut self, now: DateTime<Utc>) -> Option<StateTransition> {
        self.last_check = now;
        let level = self.registry.aggregated_level();
        self.machine.evaluate(level, now)
    }

    /// Apply new limits and thresholds, then recompute
    pub fn reconfigure(
        &mut self,
        limits: RegistryLimits,
        thresholds: StateThresholds,
        now: DateTime<Utc>,
    ) -> (Vec<ThreatEvent>, Option<StateTransition>) {
        let evicted = self.registry.set_limits(limits);
        self.machine.set_thresholds(thresholds);
        let transition = self.recompute(now);
        (evicted, transition)
    }

    /// Halve bounded buffers: resolved events and transition history
    pub fn trim_history(&mut self) -> usize {
        let transitions = self.machine.history_len();
        let removed = self.machine.trim_history(transitions / 2);
        let events = self.registry.len();
        removed + self.registry.trim_resolved(events - events / 2)
    }

    pub fn status(&self) -> ShieldStatus {
        ShieldStatus {
            state: self.machine.state(),
            aggregated_level: self.registry.aggregated_level(),
            active_threats: self.registry.active().map(|e| e.id).collect(),
            per_kind_activation: ThreatKind::ALL
                .iter()
                .map(|kind| (*kind, self.registry.is_kind_active(*kind)))
                .collect(),
            last_check: self.last_check,
        }
    }

    pub fn state(&self) -> ShieldState {
        self.machine.state()
    }

    pub fn registry(&self) -> &ThreatRegistry {
        &self.registry
    }

    pub fn machine(&self) -> &ShieldStateMachine {
        &self.machine
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    pub fn transitions(&self) -> Vec<StateTransition> {
        self.machine.history().cloned().collect()
    }
}
