/*!
 * Tier checksums
 */

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Digest used for tier and snapshot checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// BLAKE3 (fast, default)
    #[default]
    Blake3,

    /// SHA-256
    Sha256,
}

impl ChecksumAlgorithm {
    /// Lowercase hex digest of `data`
    pub fn digest(&self, data: &[u8]) -> String {
        match self {
            ChecksumAlgorithm::Blake3 => blake3::hash(data).to_hex().to_string(),
            ChecksumAlgorithm::Sha256 => hex::encode(Sha256::digest(data)),
        }
    }

    /// Whether `expected` is the digest of `data`
    pub fn verify(&self, data: &[u8], expected: &str) -> bool {
        self.digest(data).eq_ignore_ascii_case(expected)
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blake3 => write!(f, "blake3"),
            Self::Sha256 => write!(f, "sha256"),
        }
    }
}
