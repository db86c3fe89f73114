//! In-memory store implementation
//!
//! Keeps every tier in memory and offers fault injection (unavailability,
//! rejected writes, artificial latency) so the monitoring core can be
//! exercised without a real backing engine.

use crate::{Result, StoreError, StoredValue, VersionedStore};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Tier = BTreeMap<String, StoredValue>;

/// In-memory versioned store
///
/// Cloning yields another handle to the same data.
///
/// # Example
///
/// ```rust
/// use vigil_store::{MemoryStore, VersionedStore};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.insert("primary", "a", b"1");
///
/// assert_eq!(store.keys("primary").await.unwrap(), vec!["a".to_string()]);
///
/// store.set_unavailable(true);
/// assert!(store.get("primary", "a").await.is_err());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tiers: Arc<RwLock<HashMap<String, Tier>>>,
    unavailable: Arc<AtomicBool>,
    read_only: Arc<AtomicBool>,
    latency: Arc<RwLock<Option<Duration>>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a value synchronously, bumping its version like `put` does
    pub fn insert(&self, tier: &str, key: &str, bytes: &[u8]) -> u64 {
        let mut tiers = self.tiers.write();
        Self::write(tiers.entry(tier.to_string()).or_default(), key, bytes.to_vec())
    }

    /// Remove a key synchronously (bypasses fault injection)
    pub fn remove(&self, tier: &str, key: &str) {
        if let Some(entries) = self.tiers.write().get_mut(tier) {
            entries.remove(key);
        }
    }

    /// Drop every key of a tier
    pub fn clear_tier(&self, tier: &str) {
        self.tiers.write().remove(tier);
    }

    /// Read a value synchronously (bypasses fault injection)
    pub fn value(&self, tier: &str, key: &str) -> Option<StoredValue> {
        self.tiers.read().get(tier).and_then(|t| t.get(key)).cloned()
    }

    /// Total bytes held by a tier
    pub fn tier_size(&self, tier: &str) -> u64 {
        self.tiers
            .read()
            .get(tier)
            .map(|t| t.values().map(|v| v.bytes.len() as u64).sum())
            .unwrap_or(0)
    }

    /// Make every call fail with `StoreError::Unavailable`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make `put` and `delete` fail with `StoreError::WriteRejected`
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Delay every call by `latency` (None disables the delay)
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    fn write(entries: &mut Tier, key: &str, bytes: Vec<u8>) -> u64 {
        let version = entries.get(key).map(|v| v.version + 1).unwrap_or(1);
        entries.insert(key.to_string(), StoredValue::new(bytes, version));
        version
    }

    async fn gate(&self) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_writable(&self, tier: &str, key: &str) -> Result<()> {
        if self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected {
                tier: tier.to_string(),
                key: key.to_string(),
                reason: "store is read-only".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn get(&self, tier: &str, key: &str) -> Result<Option<StoredValue>> {
        self.gate().await?;
        Ok(self.value(tier, key))
    }

    async fn put(&self, tier: &str, key: &str, bytes: Vec<u8>) -> Result<u64> {
        self.gate().await?;
        self.check_writable(tier, key)?;
        let mut tiers = self.tiers.write();
        Ok(Self::write(tiers.entry(tier.to_string()).or_default(), key, bytes))
    }

    async fn delete(&self, tier: &str, key: &str) -> Result<()> {
        self.gate().await?;
        self.check_writable(tier, key)?;
        self.remove(tier, key);
        Ok(())
    }

    async fn keys(&self, tier: &str) -> Result<Vec<String>> {
        self.gate().await?;
        Ok(self
            .tiers
            .read()
            .get(tier)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_versions_increase_per_key() {
        let store = MemoryStore::new();

        assert_eq!(store.put("primary", "a", b"1".to_vec()).await.unwrap(), 1);
        assert_eq!(store.put("primary", "a", b"2".to_vec()).await.unwrap(), 2);
        assert_eq!(store.put("primary", "b", b"x".to_vec()).await.unwrap(), 1);

        let value = store.get("primary", "a").await.unwrap().unwrap();
        assert_eq!(value.bytes, b"2");
        assert_eq!(value.version, 2);
    }

    #[tokio::test]
    async fn test_tiers_are_isolated() {
        let store = MemoryStore::new();
        store.insert("primary", "a", b"1");
        store.insert("secondary", "b", b"2");

        assert_eq!(store.keys("primary").await.unwrap(), vec!["a"]);
        assert_eq!(store.keys("secondary").await.unwrap(), vec!["b"]);
        assert!(store.keys("tertiary").await.unwrap().is_empty());
        assert!(store.get("primary", "b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        store.insert("primary", "a", b"1");

        store.delete("primary", "a").await.unwrap();
        store.delete("primary", "a").await.unwrap();
        store.delete("nowhere", "a").await.unwrap();

        assert!(store.get("primary", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keys_are_sorted() {
        let store = MemoryStore::new();
        store.insert("primary", "zeta", b"1");
        store.insert("primary", "alpha", b"1");
        store.insert("primary", "mid", b"1");

        assert_eq!(
            store.keys("primary").await.unwrap(),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[tokio::test]
    async fn test_unavailable_fails_every_call() {
        let store = MemoryStore::new();
        store.insert("primary", "a", b"1");
        store.set_unavailable(true);

        assert!(matches!(
            store.get("primary", "a").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.keys("primary").await.is_err());
        assert!(store.put("primary", "a", b"2".to_vec()).await.is_err());

        store.set_unavailable(false);
        assert!(store.get("primary", "a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let store = MemoryStore::new();
        store.insert("primary", "a", b"1");
        store.set_read_only(true);

        let err = store.put("primary", "a", b"2".to_vec()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.delete("primary", "a").await.is_err());
        assert_eq!(store.value("primary", "a").unwrap().bytes, b"1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_delays_calls() {
        let store = MemoryStore::new();
        store.set_latency(Some(Duration::from_secs(5)));

        let start = tokio::time::Instant::now();
        store.keys("primary").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[test]
    fn test_tier_size() {
        let store = MemoryStore::new();
        store.insert("primary", "a", b"1234");
        store.insert("primary", "b", b"56");

        assert_eq!(store.tier_size("primary"), 6);
        store.clear_tier("primary");
        assert_eq!(store.tier_size("primary"), 0);
    }
}
