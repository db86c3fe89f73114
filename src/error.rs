/*!
 * Error types for Vigil
 *
 * Integrity, quota and conflict conditions are normally observable state
 * (threats, corruption events, pending conflicts). The variants below are
 * what surfaces when a caller asks for a hard answer: construction with a bad
 * configuration, an explicit quota gate, or a store call that failed.
 */

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;
use vigil_store::StoreError;
use vigil_threat::ThreatError;

use crate::integrity::CorruptionKind;

pub type Result<T> = std::result::Result<T, VigilError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_DEGRADED: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(Debug, Error)]
pub enum VigilError {
    /// Invalid threshold ordering, zero intervals, malformed config file
    #[error("Configuration error: {0}")]
    Config(String),

    /// A tier failed an integrity predicate
    #[error("Integrity error ({kind}) in tier '{tier}': {detail}")]
    Integrity {
        kind: CorruptionKind,
        tier: String,
        detail: String,
    },

    /// Snapshot storage is at or above the critical threshold
    #[error("Quota exceeded: {usage:.1}% of {budget_bytes} bytes in use")]
    QuotaExceeded { usage: f64, budget_bytes: u64 },

    /// Divergence that could not be written back and awaits manual action
    #[error("Unresolved sync conflict {id} for '{key}' in tier '{tier}'")]
    Conflict { id: Uuid, tier: String, key: String },

    /// Remedy attempted but nothing applicable
    #[error("Repair failed for tier '{tier}': {reason}")]
    Repair { tier: String, reason: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Store call did not complete within the configured bound
    #[error("Store operation '{operation}' timed out after {timeout:?}")]
    StoreTimeout {
        operation: String,
        timeout: Duration,
    },

    #[error("Unknown tier: {0}")]
    UnknownTier(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VigilError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        if self.is_fatal() {
            EXIT_FATAL
        } else {
            EXIT_DEGRADED
        }
    }

    /// Check if this error is fatal (retrying cannot help)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            VigilError::Config(_) | VigilError::UnknownTier(_) | VigilError::Serialization(_)
        )
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self {
            VigilError::Store(err) => err.is_transient(),
            VigilError::StoreTimeout { .. } => true,
            VigilError::Conflict { .. } => true,
            VigilError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Get error category for logging and metrics
    pub fn category(&self) -> ErrorCategory {
        match self {
            VigilError::Config(_) | VigilError::UnknownTier(_) => ErrorCategory::Configuration,
            VigilError::Integrity { .. } => ErrorCategory::Integrity,
            VigilError::QuotaExceeded { .. } => ErrorCategory::Resource,
            VigilError::Conflict { .. } => ErrorCategory::Conflict,
            VigilError::Repair { .. } => ErrorCategory::Repair,
            VigilError::Store(_) | VigilError::StoreTimeout { .. } => ErrorCategory::Store,
            VigilError::Serialization(_) => ErrorCategory::Codec,
            VigilError::Io(_) => ErrorCategory::IoError,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    /// Checksum, schema, missing or orphaned data
    Integrity,
    /// Storage budget
    Resource,
    Conflict,
    Repair,
    /// Backing store failures and timeouts
    Store,
    /// Encoding and decoding
    Codec,
    IoError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Repair => write!(f, "repair"),
            ErrorCategory::Store => write!(f, "store"),
            ErrorCategory::Codec => write!(f, "codec"),
            ErrorCategory::IoError => write!(f, "io"),
        }
    }
}

impl From<ThreatError> for VigilError {
    fn from(err: ThreatError) -> Self {
        VigilError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for VigilError {
    fn from(err: serde_json::Error) -> Self {
        VigilError::Serialization(format!("JSON error: {}", err))
    }
}

impl From<bincode::Error> for VigilError {
    fn from(err: bincode::Error) -> Self {
        VigilError::Serialization(format!("tier image error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(VigilError::Config("bad".to_string()).is_fatal());
        assert!(VigilError::UnknownTier("quaternary".to_string()).is_fatal());
        assert!(!VigilError::Store(StoreError::Unavailable("down".to_string())).is_fatal());
        assert_eq!(VigilError::Config("x".to_string()).exit_code(), EXIT_FATAL);
    }

    #[test]
    fn test_transient_errors() {
        assert!(VigilError::StoreTimeout {
            operation: "keys".to_string(),
            timeout: Duration::from_secs(2),
        }
        .is_transient());
        assert!(VigilError::Store(StoreError::Unavailable("down".to_string())).is_transient());
        assert!(!VigilError::QuotaExceeded {
            usage: 97.0,
            budget_bytes: 100,
        }
        .is_transient());
        assert!(!VigilError::Config("bad".to_string()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = VigilError::Integrity {
            kind: CorruptionKind::ChecksumMismatch,
            tier: "primary".to_string(),
            detail: "digest differs".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Integrity error (checksum_mismatch) in tier 'primary': digest differs"
        );

        let err = VigilError::QuotaExceeded {
            usage: 96.24,
            budget_bytes: 1000,
        };
        assert_eq!(err.to_string(), "Quota exceeded: 96.2% of 1000 bytes in use");
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(
            VigilError::Config("x".to_string()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            VigilError::Repair {
                tier: "primary".to_string(),
                reason: "no snapshot".to_string(),
            }
            .category(),
            ErrorCategory::Repair
        );
        assert_eq!(ErrorCategory::Store.to_string(), "store");
    }

    #[test]
    fn test_threat_error_maps_to_config() {
        let err: VigilError = ThreatError::InvalidThresholds("unordered".to_string()).into();
        assert!(matches!(err, VigilError::Config(_)));
    }
}
