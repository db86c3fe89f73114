/*!
 * Integrity checks
 *
 * A check reads a tier image and evaluates four independent predicates:
 *
 * | Issue               | Condition                                         | Severity |
 * |---------------------|---------------------------------------------------|----------|
 * | `missing_data`      | tier empty, or indexed keys absent                | 4        |
 * | `invalid_schema`    | structural predicate fails                        | 3        |
 * | `orphaned_data`     | data keys not listed in a parseable index         | 2        |
 * | `checksum_mismatch` | image digest differs from the reference snapshot  | 4        |
 *
 * A tier that cannot be read within the store timeout yields a single
 * `store_unavailable` issue at severity 5. Issues are always emitted in the
 * order above with sorted keys, so checking an unchanged tier twice yields
 * identical issues and checksum.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use vigil_store::VersionedStore;

use crate::integrity::image::{IndexState, TierImage, INDEX_KEY};
use crate::integrity::{ChecksumAlgorithm, CorruptionKind};

/// One failed predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub kind: CorruptionKind,
    pub severity: u8,
    pub description: String,
    pub affected_keys: Vec<String>,
}

impl IntegrityIssue {
    pub fn new(kind: CorruptionKind, description: impl Into<String>, affected_keys: Vec<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            description: description.into(),
            affected_keys,
        }
    }
}

/// Outcome of checking one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub timestamp: DateTime<Utc>,
    pub tier: String,
    pub passed: bool,
    pub issues: Vec<IntegrityIssue>,

    /// Digest of the tier image; absent when the tier could not be read
    pub checksum: Option<String>,

    pub size_bytes: u64,
    pub entry_count: usize,
}

impl IntegrityCheckResult {
    pub fn has_issue(&self, kind: CorruptionKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn issue_kinds(&self) -> Vec<CorruptionKind> {
        self.issues.iter().map(|i| i.kind).collect()
    }
}

/// Structural validity predicate over a tier image
pub trait SchemaValidator: Send + Sync {
    /// Keys that violate the predicate, sorted. Empty when the image is valid.
    fn invalid_keys(&self, image: &TierImage) -> Vec<String>;
}

/// Default predicate: a non-empty tier carries a parseable index and every
/// data value is valid JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexedJsonValidator;

impl SchemaValidator for IndexedJsonValidator {
    fn invalid_keys(&self, image: &TierImage) -> Vec<String> {
        if image.data_len() == 0 {
            return Vec::new();
        }

        let mut invalid = Vec::new();
        if !matches!(image.index(), IndexState::Keys(_)) {
            invalid.push(INDEX_KEY.to_string());
        }
        invalid.extend(
            image
                .entries()
                .filter(|(key, _)| key.as_str() != INDEX_KEY)
                .filter(|(_, value)| serde_json::from_slice::<serde_json::Value>(value).is_err())
                .map(|(key, _)| key.clone()),
        );
        invalid.sort();
        invalid
    }
}

/// Evaluates the integrity predicates of a tier
#[derive(Clone)]
pub struct IntegrityChecker {
    algorithm: ChecksumAlgorithm,
    validator: Arc<dyn SchemaValidator>,
}

impl fmt::Debug for IntegrityChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegrityChecker")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl IntegrityChecker {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        Self::with_validator(algorithm, Arc::new(IndexedJsonValidator))
    }

    pub fn with_validator(algorithm: ChecksumAlgorithm, validator: Arc<dyn SchemaValidator>) -> Self {
        Self {
            algorithm,
            validator,
        }
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Read `tier` and evaluate it against the reference checksum
    ///
    /// Store failures never propagate: they become a `store_unavailable` issue.
    pub async fn check(
        &self,
        store: &dyn VersionedStore,
        tier: &str,
        reference: Option<&str>,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> IntegrityCheckResult {
        match TierImage::capture(store, tier, timeout).await {
            Ok(image) => self.evaluate(tier, &image, reference, now),
            Err(e) => {
                warn!("⚠️  Tier '{}' could not be read: {}", tier, e);
                unreadable(tier, e.to_string(), now)
            }
        }
    }

    /// Evaluate an already captured image
    pub fn evaluate(
        &self,
        tier: &str,
        image: &TierImage,
        reference: Option<&str>,
        now: DateTime<Utc>,
    ) -> IntegrityCheckResult {
        let mut issues = Vec::new();
        let index = image.index();

        // missing_data
        if image.data_len() == 0 {
            issues.push(IntegrityIssue::new(
                CorruptionKind::MissingData,
                format!("tier '{}' holds no data", tier),
                Vec::new(),
            ));
        } else if let IndexState::Keys(ref listed) = index {
            let absent: Vec<String> = listed
                .iter()
                .filter(|k| !image.contains(k))
                .cloned()
                .collect();
            if !absent.is_empty() {
                issues.push(IntegrityIssue::new(
                    CorruptionKind::MissingData,
                    format!("{} indexed key(s) absent", absent.len()),
                    absent,
                ));
            }
        }

        // invalid_schema
        let invalid = self.validator.invalid_keys(image);
        if !invalid.is_empty() {
            issues.push(IntegrityIssue::new(
                CorruptionKind::InvalidSchema,
                format!("{} key(s) fail the structural predicate", invalid.len()),
                invalid,
            ));
        }

        // orphaned_data
        if let IndexState::Keys(ref listed) = index {
            let orphans: Vec<String> = image
                .data_keys()
                .filter(|k| !listed.contains(*k))
                .cloned()
                .collect();
            if !orphans.is_empty() {
                issues.push(IntegrityIssue::new(
                    CorruptionKind::OrphanedData,
                    format!("{} key(s) missing from the index", orphans.len()),
                    orphans,
                ));
            }
        }

        // checksum_mismatch
        let checksum = match image.checksum(self.algorithm) {
            Ok(checksum) => checksum,
            Err(e) => return unreadable(tier, e.to_string(), now),
        };
        if let Some(expected) = reference {
            if !expected.eq_ignore_ascii_case(&checksum) {
                issues.push(IntegrityIssue::new(
                    CorruptionKind::ChecksumMismatch,
                    format!("expected {}, got {}", short(expected), short(&checksum)),
                    Vec::new(),
                ));
            }
        }

        let passed = issues.is_empty();
        if passed {
            debug!("Tier '{}' passed integrity check ({})", tier, short(&checksum));
        }

        IntegrityCheckResult {
            timestamp: now,
            tier: tier.to_string(),
            passed,
            issues,
            checksum: Some(checksum),
            size_bytes: image.size_bytes(),
            entry_count: image.data_len(),
        }
    }
}

fn unreadable(tier: &str, detail: String, now: DateTime<Utc>) -> IntegrityCheckResult {
    IntegrityCheckResult {
        timestamp: now,
        tier: tier.to_string(),
        passed: false,
        issues: vec![IntegrityIssue::new(
            CorruptionKind::StoreUnavailable,
            format!("cannot verify tier: {}", detail),
            Vec::new(),
        )],
        checksum: None,
        size_bytes: 0,
        entry_count: 0,
    }
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

/// Bounded history of check results, oldest first
#[derive(Debug, Clone)]
pub struct CheckHistory {
    results: VecDeque<IntegrityCheckResult>,
    limit: usize,
}

impl CheckHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            results: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, result: IntegrityCheckResult) {
        self.results.push_back(result);
        while self.results.len() > self.limit {
            self.results.pop_front();
        }
    }

    /// Most recent result for `tier`
    pub fn latest(&self, tier: &str) -> Option<&IntegrityCheckResult> {
        self.results.iter().rev().find(|r| r.tier == tier)
    }

    pub fn results(&self) -> impl Iterator<Item = &IntegrityCheckResult> {
        self.results.iter()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn halve(&mut self) -> usize {
        let removed = self.results.len() - self.results.len() / 2;
        self.results.drain(..removed);
        removed
    }
}
