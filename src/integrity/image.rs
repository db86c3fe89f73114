/*!
 * Tier images
 *
 * A tier image is every `(key, bytes)` pair of a tier in key order. Its
 * bincode encoding is the tier payload: deterministic for a given content,
 * so checksums of equal tiers are equal.
 *
 * The reserved key `__index__` holds a JSON array naming the tier's data keys.
 */

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use vigil_store::{StoreError, VersionedStore};

use crate::error::{Result, VigilError};
use crate::integrity::ChecksumAlgorithm;

/// Reserved key listing the data keys of a tier
pub const INDEX_KEY: &str = "__index__";

/// State of a tier's index entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexState {
    Absent,
    /// Present but not a JSON array of strings
    Malformed,
    Keys(BTreeSet<String>),
}

/// In-memory copy of one tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierImage {
    entries: BTreeMap<String, Vec<u8>>,
}

impl TierImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self { entries }
    }

    /// Build a well-formed image: every value plus a matching index
    pub fn indexed<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let mut image = Self::new();
        for (key, value) in values {
            image.insert(key, value);
        }
        let keys: Vec<String> = image.data_keys().cloned().collect();
        image.set_index(&keys);
        image
    }

    /// Read a whole tier from the store, each call bounded by `timeout`
    pub async fn capture(
        store: &dyn VersionedStore,
        tier: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let keys = bounded("keys", timeout, store.keys(tier)).await?;
        let mut entries = BTreeMap::new();
        for key in keys {
            if let Some(value) = bounded("get", timeout, store.get(tier, &key)).await? {
                entries.insert(key, value.bytes);
            }
        }
        Ok(Self { entries })
    }

    /// Make the tier equal to this image: stale keys are deleted, every
    /// entry is written.
    pub async fn restore(
        &self,
        store: &dyn VersionedStore,
        tier: &str,
        timeout: Duration,
    ) -> Result<()> {
        let current = bounded("keys", timeout, store.keys(tier)).await?;
        for key in current.iter().filter(|k| !self.entries.contains_key(*k)) {
            bounded("delete", timeout, store.delete(tier, key)).await?;
        }
        for (key, bytes) in &self.entries {
            bounded("put", timeout, store.put(tier, key, bytes.clone())).await?;
        }
        debug!(
            "Restored tier '{}' ({} entries, {} stale removed)",
            tier,
            self.entries.len(),
            current.iter().filter(|k| !self.entries.contains_key(*k)).count()
        );
        Ok(())
    }

    /// Deterministic payload; an empty tier encodes to no bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        Ok(bincode::serialize(&self.entries)?)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Self::new());
        }
        let entries: BTreeMap<String, Vec<u8>> = bincode::deserialize(payload)?;
        Ok(Self { entries })
    }

    /// Checksum of the encoded payload
    pub fn checksum(&self, algorithm: ChecksumAlgorithm) -> Result<String> {
        Ok(algorithm.digest(&self.encode()?))
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by values, the live size of the tier
    pub fn size_bytes(&self) -> u64 {
        self.entries.values().map(|v| v.len() as u64).sum()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.entries.iter()
    }

    /// Keys other than the index, in order
    pub fn data_keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys().filter(|k| k.as_str() != INDEX_KEY)
    }

    pub fn data_len(&self) -> usize {
        self.data_keys().count()
    }

    pub fn index(&self) -> IndexState {
        match self.entries.get(INDEX_KEY) {
            None => IndexState::Absent,
            Some(raw) => parse_index(raw).map_or(IndexState::Malformed, IndexState::Keys),
        }
    }

    /// Insert a value and list it in the index, the in-memory counterpart
    /// of a store-side indexed write
    pub fn put_indexed(&mut self, key: &str, value: Vec<u8>) {
        self.insert(key, value);
        if key == INDEX_KEY {
            return;
        }
        let mut keys = match self.index() {
            IndexState::Keys(keys) => keys,
            IndexState::Absent | IndexState::Malformed => BTreeSet::new(),
        };
        if keys.insert(key.to_string()) {
            let keys: Vec<String> = keys.into_iter().collect();
            self.set_index(&keys);
        }
    }

    /// Replace the index with `keys`
    pub fn set_index(&mut self, keys: &[String]) {
        let sorted: BTreeSet<&String> = keys.iter().collect();
        // A Vec of strings always serializes
        let raw = serde_json::to_vec(&sorted).unwrap_or_default();
        self.entries.insert(INDEX_KEY.to_string(), raw);
    }
}

fn parse_index(raw: &[u8]) -> Option<BTreeSet<String>> {
    serde_json::from_slice::<Vec<String>>(raw)
        .ok()
        .map(|keys| keys.into_iter().collect())
}

/// Run a store call under `timeout`, mapping failures into [`VigilError`]
pub(crate) async fn bounded<T, F>(operation: &str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(VigilError::from),
        Err(_) => Err(VigilError::StoreTimeout {
            operation: operation.to_string(),
            timeout,
        }),
    }
}

/// Write one value and make sure the tier index lists it
pub(crate) async fn write_indexed(
    store: &dyn VersionedStore,
    tier: &str,
    key: &str,
    bytes: Vec<u8>,
    timeout: Duration,
) -> Result<u64> {
    let version = bounded("put", timeout, store.put(tier, key, bytes)).await?;
    if key == INDEX_KEY {
        return Ok(version);
    }

    let current = bounded("get", timeout, store.get(tier, INDEX_KEY)).await?;
    let mut keys = current
        .as_ref()
        .and_then(|v| parse_index(&v.bytes))
        .unwrap_or_default();
    if current.is_none() || !keys.contains(key) {
        keys.insert(key.to_string());
        let raw = serde_json::to_vec(&keys)?;
        bounded("put", timeout, store.put(tier, INDEX_KEY, raw)).await?;
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_store::MemoryStore;

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn test_encoding_is_deterministic() {
        let a = TierImage::indexed([("b", b"2".to_vec()), ("a", b"1".to_vec())]);
        let b = TierImage::indexed([("a", b"1".to_vec()), ("b", b"2".to_vec())]);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
        assert_eq!(
            a.checksum(ChecksumAlgorithm::Blake3).unwrap(),
            b.checksum(ChecksumAlgorithm::Blake3).unwrap()
        );
        assert_eq!(TierImage::decode(&a.encode().unwrap()).unwrap(), a);
    }

    #[test]
    fn test_empty_image_has_empty_payload() {
        let image = TierImage::new();
        assert!(image.encode().unwrap().is_empty());
        assert!(TierImage::decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(TierImage::decode(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_index_states() {
        let mut image = TierImage::new();
        image.insert("a", b"{}".to_vec());
        assert_eq!(image.index(), IndexState::Absent);

        image.insert(INDEX_KEY, b"not json".to_vec());
        assert_eq!(image.index(), IndexState::Malformed);

        image.set_index(&["a".to_string()]);
        match image.index() {
            IndexState::Keys(keys) => assert!(keys.contains("a")),
            other => panic!("unexpected index state: {:?}", other),
        }
        assert_eq!(image.data_len(), 1);
    }

    #[tokio::test]
    async fn test_capture_and_restore() {
        let store = MemoryStore::new();
        store.insert("primary", "a", b"1");
        store.insert("primary", "b", b"2");

        let image = TierImage::capture(&store, "primary", TIMEOUT).await.unwrap();
        assert_eq!(image.len(), 2);
        assert_eq!(image.size_bytes(), 2);

        store.insert("primary", "a", b"changed");
        store.insert("primary", "c", b"new");

        image.restore(&store, "primary", TIMEOUT).await.unwrap();
        assert_eq!(store.value("primary", "a").unwrap().bytes, b"1");
        assert!(store.value("primary", "c").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_times_out() {
        let store = MemoryStore::new();
        store.set_latency(Some(Duration::from_secs(10)));

        let err = TierImage::capture(&store, "primary", TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, VigilError::StoreTimeout { .. }));
    }

    #[tokio::test]
    async fn test_write_indexed_adds_key_once() {
        let store = MemoryStore::new();
        write_indexed(&store, "primary", "k", b"1".to_vec(), TIMEOUT)
            .await
            .unwrap();
        write_indexed(&store, "primary", "k", b"2".to_vec(), TIMEOUT)
            .await
            .unwrap();

        let index = store.value("primary", INDEX_KEY).unwrap();
        assert_eq!(index.version, 1);
        assert_eq!(index.bytes, br#"["k"]"#);
        assert_eq!(store.value("primary", "k").unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_put_indexed_matches_the_store_write() {
        let store = MemoryStore::new();
        store.insert("primary", "a", b"1");
        store.insert("primary", INDEX_KEY, br#"["a"]"#);
        let mut image = TierImage::capture(&store, "primary", TIMEOUT).await.unwrap();

        write_indexed(&store, "primary", "b", b"2".to_vec(), TIMEOUT)
            .await
            .unwrap();
        image.put_indexed("b", b"2".to_vec());

        let after = TierImage::capture(&store, "primary", TIMEOUT).await.unwrap();
        assert_eq!(image, after);
        assert_eq!(
            image.checksum(ChecksumAlgorithm::Sha256).unwrap(),
            after.checksum(ChecksumAlgorithm::Sha256).unwrap()
        );
    }
}
