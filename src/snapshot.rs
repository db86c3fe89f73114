/*!
 * Snapshot store
 *
 * Retains versioned, checksummed copies of each tier. Versions are assigned
 * under the store's lock, one per tier, starting at 1 and never reused even
 * after the snapshot is evicted.
 *
 * Each tier also has a *reference* snapshot: the one the live tier is
 * expected to match. Taking a snapshot makes it the reference; rolling back
 * makes the restored snapshot the reference. When the reference is evicted
 * the most recent snapshot takes its place.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::integrity::{ChecksumAlgorithm, TierImage};

/// Immutable point-in-time copy of a tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tier: String,

    /// Encoded tier image
    pub payload: Vec<u8>,

    pub checksum: String,
    pub algorithm: ChecksumAlgorithm,

    /// Monotonic per tier, starting at 1
    pub version: u64,

    pub size_bytes: u64,
    pub entry_count: usize,
}

impl MemorySnapshot {
    /// Whether the recorded checksum can be reproduced from the payload
    pub fn verify(&self) -> bool {
        self.algorithm.verify(&self.payload, &self.checksum)
    }

    pub fn image(&self) -> Result<TierImage> {
        TierImage::decode(&self.payload)
    }

    pub fn meta(&self) -> SnapshotMeta {
        SnapshotMeta {
            id: self.id,
            timestamp: self.timestamp,
            tier: self.tier.clone(),
            checksum: self.checksum.clone(),
            algorithm: self.algorithm,
            version: self.version,
            size_bytes: self.size_bytes,
            entry_count: self.entry_count,
        }
    }
}

/// Snapshot without its payload, for listings and export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub tier: String,
    pub checksum: String,
    pub algorithm: ChecksumAlgorithm,
    pub version: u64,
    pub size_bytes: u64,
    pub entry_count: usize,
}

/// Per-tier snapshot retention
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    tiers: HashMap<String, VecDeque<MemorySnapshot>>,
    last_version: HashMap<String, u64>,
    reference: HashMap<String, Uuid>,
    max_snapshots: usize,
}

impl SnapshotStore {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            tiers: HashMap::new(),
            last_version: HashMap::new(),
            reference: HashMap::new(),
            max_snapshots: max_snapshots.max(1),
        }
    }

    /// Record a new snapshot of `image` for `tier`.
    ///
    /// Returns the snapshot and the metadata of any snapshots evicted to stay
    /// within `max_snapshots`.
    pub fn take(
        &mut self,
        tier: &str,
        image: &TierImage,
        algorithm: ChecksumAlgorithm,
        now: DateTime<Utc>,
    ) -> Result<(MemorySnapshot, Vec<SnapshotMeta>)> {
        let payload = image.encode()?;
        let version = self.last_version.get(tier).copied().unwrap_or(0) + 1;

        let snapshot = MemorySnapshot {
            id: Uuid::new_v4(),
            timestamp: now,
            tier: tier.to_string(),
            checksum: algorithm.digest(&payload),
            algorithm,
            version,
            size_bytes: payload.len() as u64,
            entry_count: image.data_len(),
            payload,
        };

        self.last_version.insert(tier.to_string(), version);
        self.reference.insert(tier.to_string(), snapshot.id);

        let history = self.tiers.entry(tier.to_string()).or_default();
        history.push_back(snapshot.clone());

        let mut evicted = Vec::new();
        while history.len() > self.max_snapshots {
            if let Some(old) = history.pop_front() {
                debug!(
                    "Evicted snapshot v{} of tier '{}' (retention {})",
                    old.version, tier, self.max_snapshots
                );
                evicted.push(old.meta());
            }
        }

        Ok((snapshot, evicted))
    }

    pub fn get(&self, id: Uuid) -> Option<&MemorySnapshot> {
        self.tiers.values().flatten().find(|s| s.id == id)
    }

    #[cfg(test)]
    pub(crate) fn get_mut(&mut self, id: Uuid) -> Option<&mut MemorySnapshot> {
        self.tiers.values_mut().flatten().find(|s| s.id == id)
    }

    pub fn most_recent(&self, tier: &str) -> Option<&MemorySnapshot> {
        self.tiers.get(tier).and_then(|h| h.back())
    }

    /// Snapshot the live tier is expected to match
    pub fn reference(&self, tier: &str) -> Option<&MemorySnapshot> {
        self.reference
            .get(tier)
            .and_then(|id| self.tiers.get(tier)?.iter().find(|s| s.id == *id))
            .or_else(|| self.most_recent(tier))
    }

    pub fn reference_checksum(&self, tier: &str) -> Option<String> {
        self.reference(tier).map(|s| s.checksum.clone())
    }

    /// Make a retained snapshot the reference of its tier
    pub fn set_reference(&mut self, id: Uuid) -> bool {
        match self.get(id).map(|s| s.tier.clone()) {
            Some(tier) => {
                self.reference.insert(tier, id);
                true
            }
            None => false,
        }
    }

    /// Snapshots of `tier`, oldest first
    pub fn snapshots(&self, tier: &str) -> Vec<SnapshotMeta> {
        self.tiers
            .get(tier)
            .map(|h| h.iter().map(MemorySnapshot::meta).collect())
            .unwrap_or_default()
    }

    /// Every retained snapshot, oldest first
    pub fn all_meta(&self) -> Vec<SnapshotMeta> {
        let mut all: Vec<SnapshotMeta> = self
            .tiers
            .values()
            .flatten()
            .map(MemorySnapshot::meta)
            .collect();
        all.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.tier.cmp(&b.tier))
                .then_with(|| a.version.cmp(&b.version))
        });
        all
    }

    /// Last version assigned to `tier` (0 when none)
    pub fn last_version(&self, tier: &str) -> u64 {
        self.last_version.get(tier).copied().unwrap_or(0)
    }

    pub fn count(&self) -> usize {
        self.tiers.values().map(VecDeque::len).sum()
    }

    /// Payload bytes held by every retained snapshot
    pub fn total_bytes(&self) -> u64 {
        self.tiers.values().flatten().map(|s| s.size_bytes).sum()
    }

    /// Delete the `count` oldest snapshots across all tiers
    pub fn evict_oldest(&mut self, count: usize) -> Vec<SnapshotMeta> {
        let victims: Vec<SnapshotMeta> = self.all_meta().into_iter().take(count).collect();
        for victim in &victims {
            if let Some(history) = self.tiers.get_mut(&victim.tier) {
                history.retain(|s| s.id != victim.id);
            }
        }
        victims
    }

    pub fn max_snapshots(&self) -> usize {
        self.max_snapshots
    }

    /// Change the per-tier cap, evicting over-cap snapshots
    pub fn set_max_snapshots(&mut self, max_snapshots: usize) -> Vec<SnapshotMeta> {
        self.max_snapshots = max_snapshots.max(1);
        let mut evicted = Vec::new();
        for history in self.tiers.values_mut() {
            while history.len() > self.max_snapshots {
                if let Some(old) = history.pop_front() {
                    evicted.push(old.meta());
                }
            }
        }
        evicted
    }
}
