//! Error types for the threat core

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThreatError {
    /// State thresholds are not strictly increasing or fall outside 1..=100
    #[error("Invalid state thresholds: {0}")]
    InvalidThresholds(String),

    /// Registry limits cannot hold any event
    #[error("Invalid registry limits: {0}")]
    InvalidLimits(String),

    #[error("Unknown threat kind: {0}")]
    UnknownKind(String),
}
