/*!
 * Sync conflict resolution
 *
 * A conflict exists when two writers hold different versions of the same
 * key in a tier. At most one conflict is pending per `(tier, key)` pair; a
 * second detection returns the pending one.
 *
 * Strategies:
 *
 * - `local` / `remote`: keep that side, with its version
 * - `newest`: keep the side with the strictly greater version
 * - `merged`: shallow merge of two JSON objects, remote fields win on
 *   collisions; if either side is not an object the remote payload wins.
 *   The merged record gets version `max(local, remote) + 1`.
 */

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::VigilError;

/// One side of a conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub version: u64,
    pub payload: Value,
}

impl VersionedRecord {
    pub fn new(version: u64, payload: Value) -> Self {
        Self { version, payload }
    }
}

/// How a conflict should be settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    Local,
    Remote,
    Newest,
    Merged,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Local => "local",
            ResolutionStrategy::Remote => "remote",
            ResolutionStrategy::Newest => "newest",
            ResolutionStrategy::Merged => "merged",
        }
    }

    /// Record that settles `local` against `remote`
    pub fn apply(&self, local: &VersionedRecord, remote: &VersionedRecord) -> VersionedRecord {
        match self {
            ResolutionStrategy::Local => local.clone(),
            ResolutionStrategy::Remote => remote.clone(),
            ResolutionStrategy::Newest => {
                if remote.version > local.version {
                    remote.clone()
                } else {
                    local.clone()
                }
            }
            ResolutionStrategy::Merged => VersionedRecord {
                version: local.version.max(remote.version) + 1,
                payload: shallow_merge(&local.payload, &remote.payload),
            },
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = VigilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ResolutionStrategy::Local),
            "remote" => Ok(ResolutionStrategy::Remote),
            "newest" => Ok(ResolutionStrategy::Newest),
            "merged" => Ok(ResolutionStrategy::Merged),
            other => Err(VigilError::Config(format!(
                "unknown resolution strategy '{}'",
                other
            ))),
        }
    }
}

fn shallow_merge(local: &Value, remote: &Value) -> Value {
    match (local, remote) {
        (Value::Object(l), Value::Object(r)) => {
            let mut merged = l.clone();
            for (key, value) in r {
                merged.insert(key.clone(), value.clone());
            }
            Value::Object(merged)
        }
        _ => remote.clone(),
    }
}

/// Resolution state of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Pending,
    Local,
    Remote,
    Newest,
    Merged,
}

impl From<ResolutionStrategy> for Resolution {
    fn from(strategy: ResolutionStrategy) -> Self {
        match strategy {
            ResolutionStrategy::Local => Resolution::Local,
            ResolutionStrategy::Remote => Resolution::Remote,
            ResolutionStrategy::Newest => Resolution::Newest,
            ResolutionStrategy::Merged => Resolution::Merged,
        }
    }
}

/// Divergence between two versions of one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub key: String,
    pub tier: String,
    pub local_version: u64,
    pub remote_version: u64,
    pub local_payload: Value,
    pub remote_payload: Value,
    pub resolution: Resolution,

    /// Failed write-back attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Threat raised when the conflict was detected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threat_id: Option<Uuid>,
}

impl SyncConflict {
    pub fn local(&self) -> VersionedRecord {
        VersionedRecord::new(self.local_version, self.local_payload.clone())
    }

    pub fn remote(&self) -> VersionedRecord {
        VersionedRecord::new(self.remote_version, self.remote_payload.clone())
    }
}

/// A settled conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConflict {
    pub conflict_id: Uuid,
    pub key: String,
    pub tier: String,
    pub strategy: ResolutionStrategy,

    /// Version of the chosen record
    pub version: u64,
    pub payload: Value,

    /// Version the backing store assigned to the write
    pub store_version: u64,
}

/// Result of a detection
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Versions agree
    InSync,
    /// A new conflict was created
    New(SyncConflict),
    /// A conflict for the same key and tier was already pending
    Existing(SyncConflict),
}

impl Detection {
    pub fn conflict(&self) -> Option<&SyncConflict> {
        match self {
            Detection::InSync => None,
            Detection::New(c) | Detection::Existing(c) => Some(c),
        }
    }

    pub fn into_conflict(self) -> Option<SyncConflict> {
        match self {
            Detection::InSync => None,
            Detection::New(c) | Detection::Existing(c) => Some(c),
        }
    }
}

/// Lifetime counters of the resolver
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStats {
    pub detected: u64,
    pub resolved: u64,
    pub write_failures: u64,
}

/// Pending-conflict set
#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    pending: Vec<SyncConflict>,
    stats: ConflictStats,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn detect(
        &mut self,
        key: &str,
        tier: &str,
        local: &VersionedRecord,
        remote: &VersionedRecord,
        now: DateTime<Utc>,
    ) -> Detection {
        if local.version == remote.version {
            return Detection::InSync;
        }

        if let Some(existing) = self
            .pending
            .iter()
            .find(|c| c.key == key && c.tier == tier)
        {
            return Detection::Existing(existing.clone());
        }

        let conflict = SyncConflict {
            id: Uuid::new_v4(),
            timestamp: now,
            key: key.to_string(),
            tier: tier.to_string(),
            local_version: local.version,
            remote_version: remote.version,
            local_payload: local.payload.clone(),
            remote_payload: remote.payload.clone(),
            resolution: Resolution::Pending,
            attempts: 0,
            threat_id: None,
        };
        self.pending.push(conflict.clone());
        self.stats.detected += 1;
        Detection::New(conflict)
    }

    /// Remember the threat raised for a conflict
    pub fn link_threat(&mut self, id: Uuid, threat_id: Uuid) {
        if let Some(conflict) = self.pending.iter_mut().find(|c| c.id == id) {
            conflict.threat_id = Some(threat_id);
        }
    }

    /// Chosen record for a pending conflict, without settling it
    pub fn plan(&self, id: Uuid, strategy: ResolutionStrategy) -> Option<(SyncConflict, VersionedRecord)> {
        let conflict = self.get(id)?;
        let chosen = strategy.apply(&conflict.local(), &conflict.remote());
        Some((conflict.clone(), chosen))
    }

    /// Remove a settled conflict from the pending set.
    ///
    /// Returns `None` if the conflict is no longer pending.
    pub fn complete(&mut self, id: Uuid, strategy: ResolutionStrategy) -> Option<SyncConflict> {
        let idx = self.pending.iter().position(|c| c.id == id)?;
        let mut conflict = self.pending.remove(idx);
        conflict.resolution = strategy.into();
        self.stats.resolved += 1;
        Some(conflict)
    }

    /// Count a failed write-back; the conflict stays pending
    pub fn record_failure(&mut self, id: Uuid) {
        self.stats.write_failures += 1;
        if let Some(conflict) = self.pending.iter_mut().find(|c| c.id == id) {
            conflict.attempts += 1;
        }
    }

    /// Settle a conflict without writing anywhere
    pub fn resolve(&mut self, id: Uuid, strategy: ResolutionStrategy) -> Option<VersionedRecord> {
        let (_, chosen) = self.plan(id, strategy)?;
        self.complete(id, strategy)?;
        Some(chosen)
    }

    pub fn get(&self, id: Uuid) -> Option<&SyncConflict> {
        self.pending.iter().find(|c| c.id == id)
    }

    pub fn pending(&self) -> &[SyncConflict] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn stats(&self) -> ConflictStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(version: u64, payload: Value) -> VersionedRecord {
        VersionedRecord::new(version, payload)
    }

    #[test]
    fn test_equal_versions_are_in_sync() {
        let mut resolver = ConflictResolver::new();
        let detection = resolver.detect(
            "k",
            "primary",
            &record(2, json!({"a": 1})),
            &record(2, json!({"a": 2})),
            Utc::now(),
        );
        assert_eq!(detection, Detection::InSync);
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_one_conflict_per_key_and_tier() {
        let mut resolver = ConflictResolver::new();
        let now = Utc::now();
        let first = resolver.detect("k", "primary", &record(1, json!(1)), &record(2, json!(2)), now);
        let again = resolver.detect("k", "primary", &record(1, json!(1)), &record(3, json!(3)), now);
        let other_tier = resolver.detect("k", "secondary", &record(1, json!(1)), &record(2, json!(2)), now);

        assert!(matches!(first, Detection::New(_)));
        assert!(matches!(again, Detection::Existing(_)));
        assert_eq!(first.conflict().unwrap().id, again.conflict().unwrap().id);
        assert!(matches!(other_tier, Detection::New(_)));
        assert_eq!(resolver.len(), 2);
        assert_eq!(resolver.stats().detected, 2);
    }

    #[test]
    fn test_newest_picks_remote_and_removes_once() {
        let mut resolver = ConflictResolver::new();
        let conflict = resolver
            .detect(
                "k",
                "primary",
                &record(2, json!({"side": "local"})),
                &record(3, json!({"side": "remote"})),
                Utc::now(),
            )
            .into_conflict()
            .unwrap();

        let chosen = resolver.resolve(conflict.id, ResolutionStrategy::Newest).unwrap();
        assert_eq!(chosen.version, 3);
        assert_eq!(chosen.payload, json!({"side": "remote"}));
        assert!(resolver.is_empty());
        assert_eq!(resolver.stats().resolved, 1);

        assert!(resolver.resolve(conflict.id, ResolutionStrategy::Newest).is_none());
        assert_eq!(resolver.stats().resolved, 1);
    }

    #[test]
    fn test_newest_picks_local_when_greater() {
        let chosen = ResolutionStrategy::Newest.apply(&record(5, json!("l")), &record(4, json!("r")));
        assert_eq!(chosen, record(5, json!("l")));
    }

    #[test]
    fn test_local_and_remote() {
        let local = record(1, json!({"a": 1}));
        let remote = record(7, json!({"a": 2}));
        assert_eq!(ResolutionStrategy::Local.apply(&local, &remote), local);
        assert_eq!(ResolutionStrategy::Remote.apply(&local, &remote), remote);
    }

    #[test]
    fn test_merged_remote_wins_collisions() {
        let merged = ResolutionStrategy::Merged.apply(
            &record(2, json!({"a": 1, "b": 1})),
            &record(4, json!({"b": 2, "c": 3})),
        );
        assert_eq!(merged.version, 5);
        assert_eq!(merged.payload, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[test]
    fn test_merged_non_objects_take_remote() {
        let merged = ResolutionStrategy::Merged.apply(&record(1, json!({"a": 1})), &record(2, json!([1, 2])));
        assert_eq!(merged.payload, json!([1, 2]));
        assert_eq!(merged.version, 3);
    }

    #[test]
    fn test_failures_keep_conflict_pending() {
        let mut resolver = ConflictResolver::new();
        let conflict = resolver
            .detect("k", "primary", &record(1, json!(1)), &record(2, json!(2)), Utc::now())
            .into_conflict()
            .unwrap();

        resolver.record_failure(conflict.id);
        resolver.record_failure(conflict.id);
        assert_eq!(resolver.get(conflict.id).unwrap().attempts, 2);
        assert_eq!(resolver.stats().write_failures, 2);

        let done = resolver.complete(conflict.id, ResolutionStrategy::Merged).unwrap();
        assert_eq!(done.resolution, Resolution::Merged);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("NEWEST".parse::<ResolutionStrategy>().unwrap(), ResolutionStrategy::Newest);
        assert!("coinflip".parse::<ResolutionStrategy>().is_err());
        assert_eq!(
            serde_json::to_string(&Resolution::Pending).unwrap(),
            "\"pending\""
        );
    }
}
