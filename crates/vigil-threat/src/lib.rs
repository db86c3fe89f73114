//! Vigil Threat: Pure-logic threat aggregation
//!
//! # Overview
//!
//! This crate turns heterogeneous health signals into one system-wide alert
//! level. It includes:
//!
//! - **Threat Registry**: Bounded log of threat events with resolution and retention
//! - **Shield State Machine**: Threshold classification of the aggregated level
//! - **Threat Monitor**: Registry and state machine kept consistent under one owner
//! - **Event Bus**: Synchronous publish/subscribe for threats and state changes
//!
//! # Key Principles
//!
//! This crate is **pure logic** with zero knowledge of storage, scheduling or
//! transport. Callers pass the current time explicitly, which keeps every
//! computation deterministic and testable.
//!
//! # Architecture
//!
//! ```text
//! report / resolve
//!        │
//!        ▼
//! ┌─────────────────────────────────────────┐
//! │       Threat Registry                   │  ← Bounded event log
//! │  (cap eviction, retention pruning)      │
//! └─────────────┬───────────────────────────┘
//!               │ aggregated level (0-100)
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Shield State Machine              │  ← NORMAL / ELEVATED / HIGH / CRITICAL
//! │  (thresholds, optional hysteresis)      │
//! └─────────────┬───────────────────────────┘
//!               │ transitions
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Event Bus                         │  ← Inline, registration-ordered delivery
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```
//! use chrono::Utc;
//! use vigil_threat::{ShieldState, ThreatKind, ThreatMonitor, ThreatReport};
//!
//! let mut monitor = ThreatMonitor::with_defaults(Utc::now());
//!
//! let outcome = monitor.report(
//!     ThreatReport::new(ThreatKind::Memory, 4, "disk", "disk full"),
//!     Utc::now(),
//! );
//!
//! assert_eq!(monitor.status().aggregated_level, 80);
//! assert_eq!(monitor.status().state, ShieldState::Critical);
//! assert!(outcome.transition.is_some());
//! ```

pub mod bus;
pub mod error;
pub mod event;
pub mod monitor;
pub mod registry;
pub mod state;

pub use bus::{EventBus, StateCallback, Subscription, ThreatCallback};
pub use error::ThreatError;
pub use event::{ThreatEvent, ThreatKind, ThreatReport, MAX_THREAT_LEVEL};
pub use monitor::{ReportOutcome, ResolveOutcome, ShieldStatus, ThreatMonitor};
pub use registry::{RegistryLimits, RegistryStats, ThreatRegistry};
pub use state::{ShieldState, ShieldStateMachine, StateThresholds, StateTransition};

/// Prelude module for convenient imports
pub mod prelude {
    pub use super::bus::{EventBus, Subscription};
    pub use super::event::{ThreatEvent, ThreatKind, ThreatReport};
    pub use super::monitor::{ShieldStatus, ThreatMonitor};
    pub use super::state::{ShieldState, StateThresholds, StateTransition};
}
