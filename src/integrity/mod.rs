/*!
 * Storage integrity
 *
 * Checksums, tier images, integrity checks and the corruption ledger.
 */

pub mod checker;
pub mod checksum;
pub mod corruption;
pub mod image;

pub use checker::{
    CheckHistory, IndexedJsonValidator, IntegrityCheckResult, IntegrityChecker, IntegrityIssue,
    SchemaValidator,
};
pub use checksum::ChecksumAlgorithm;
pub use corruption::{CorruptionEvent, CorruptionKind, CorruptionLedger};
pub use image::{IndexState, TierImage, INDEX_KEY};
