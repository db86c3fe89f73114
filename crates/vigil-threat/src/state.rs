//! Shield State Machine
//!
//! Derives a discrete alert state from the aggregated threat level.
//!
//! ```text
//!   0 ──────── 25 ──────── 50 ──────── 75 ──────── 100
//!   │ NORMAL   │ ELEVATED  │ HIGH      │ CRITICAL   │
//! ```
//!
//! There is no terminal state: every recompute classifies the level afresh.
//! With a non-zero hysteresis margin, a downgrade past a threshold requires
//! the level to fall `hysteresis` points below it. Upgrades are immediate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use crate::error::ThreatError;

/// Discrete alert state
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum ShieldState {
    #[default]
    Normal,
    Elevated,
    High,
    Critical,
}

impl ShieldState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShieldState::Normal => "NORMAL",
            ShieldState::Elevated => "ELEVATED",
            ShieldState::High => "HIGH",
            ShieldState::Critical => "CRITICAL",
        }
    }

    pub fn is_alerting(&self) -> bool {
        *self >= ShieldState::High
    }
}

impl fmt::Display for ShieldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level cutoffs for each state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateThresholds {
    /// Level at or above which the shield is ELEVATED
    pub elevated: u8,

    /// Level at or above which the shield is HIGH
    pub high: u8,

    /// Level at or above which the shield is CRITICAL
    pub critical: u8,

    /// Points below a threshold the level must reach before downgrading (0 = off)
    pub hysteresis: u8,
}

impl Default for StateThresholds {
    fn default() -> Self {
        Self {
            elevated: 25,
            high: 50,
            critical: 75,
            hysteresis: 0,
        }
    }
}

impl StateThresholds {
    /// Check ordering and ranges
    pub fn validate(&self) -> Result<(), ThreatError> {
        if self.elevated == 0 || self.critical > 100 {
            return Err(ThreatError::InvalidThresholds(format!(
                "thresholds must lie within 1..=100 (got {}/{}/{})",
                self.elevated, self.high, self.critical
            )));
        }
        if !(self.elevated < self.high && self.high < self.critical) {
            return Err(ThreatError::InvalidThresholds(format!(
                "thresholds must be strictly increasing (got {}/{}/{})",
                self.elevated, self.high, self.critical
            )));
        }
        if self.hysteresis >= self.elevated {
            return Err(ThreatError::InvalidThresholds(format!(
                "hysteresis {} must be below the elevated threshold {}",
                self.hysteresis, self.elevated
            )));
        }
        Ok(())
    }

    /// Pure threshold classification, ignoring hysteresis
    pub fn classify(&self, level: u8) -> ShieldState {
        if level >= self.critical {
            ShieldState::Critical
        } else if level >= self.high {
            ShieldState::High
        } else if level >= self.elevated {
            ShieldState::Elevated
        } else {
            ShieldState::Normal
        }
    }

    /// State reached from `current` at `level`, honouring the hysteresis margin
    pub fn next_state(&self, current: ShieldState, level: u8) -> ShieldState {
        let target = self.classify(level);
        if target >= current || self.hysteresis == 0 {
            return target;
        }
        self.classify(level.saturating_add(self.hysteresis)).min(current)
    }
}

/// A recorded change of state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ShieldState,
    pub to: ShieldState,

    /// When `to` was entered
    pub entered_at: DateTime<Utc>,

    /// How long the shield stayed in `from`
    pub previous_state_duration: Duration,

    /// Aggregated level that caused the change
    pub level: u8,
}

/// Current alert state plus bounded transition history
#[derive(Debug, Clone)]
pub struct ShieldStateMachine {
    thresholds: StateThresholds,
    state: ShieldState,
    entered_at: DateTime<Utc>,
    history: VecDeque<StateTransition>,
    history_limit: usize,
}

impl ShieldStateMachine {
    /// Start in NORMAL at `now`
    pub fn new(thresholds: StateThresholds, history_limit: usize, now: DateTime<Utc>) -> Self {
        Self {
            thresholds,
            state: ShieldState::Normal,
            entered_at: now,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Re-derive the state from `level`.
    ///
    /// Returns the transition when the state changed.
    pub fn evaluate(&mut self, level: u8, now: DateTime<Utc>) -> Option<StateTransition> {
        let next = self.thresholds.next_state(self.state, level);
        if next == self.state {
            return None;
        }

        let transition = StateTransition {
            from: self.state,
            to: next,
            entered_at: now,
            previous_state_duration: now
                .signed_duration_since(self.entered_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
            level,
        };

        self.state = next;
        self.entered_at = now;
        self.history.push_back(transition.clone());
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }

        Some(transition)
    }

    pub fn state(&self) -> ShieldState {
        self.state
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn thresholds(&self) -> StateThresholds {
        self.thresholds
    }

    /// Replace the thresholds; the state is re-derived on the next evaluation
    pub fn set_thresholds(&mut self, thresholds: StateThresholds) {
        self.thresholds = thresholds;
    }

    /// Transition history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &StateTransition> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Keep only the newest `keep` transitions
    pub fn trim_history(&mut self, keep: usize) -> usize {
        let mut removed = 0;
        while self.history.len() > keep {
            self.history.pop_front();
            removed += 1;
        }
        removed
    }
}
