//! Vigil Store: Versioned Key/Value Storage Boundary
//!
//! This crate defines the `VersionedStore` trait, the only contract the vigil
//! monitoring core assumes about its backing store: opaque bytes addressed by
//! `(tier, key)`, each carrying a monotonically increasing version number.
//!
//! # Architecture
//!
//! The trait provides two categories of operations:
//!
//! 1. **Discovery**: enumerate the keys of a tier
//! 2. **Data Access**: versioned reads, writes and deletes
//!
//! # Example
//!
//! ```rust,no_run
//! use vigil_store::{MemoryStore, VersionedStore};
//!
//! # async fn example() -> Result<(), vigil_store::StoreError> {
//! let store = MemoryStore::new();
//! let v1 = store.put("primary", "positions", b"{}".to_vec()).await?;
//! let v2 = store.put("primary", "positions", b"{\"btc\":1}".to_vec()).await?;
//! assert_eq!(v2, v1 + 1);
//!
//! let value = store.get("primary", "positions").await?.unwrap();
//! assert_eq!(value.version, v2);
//! # Ok(())
//! # }
//! ```
//!
//! # Design Philosophy
//!
//! The core never assumes a schema beyond opaque bytes plus a version, so any
//! engine (embedded database, object store, remote service) can sit behind it.
//! Callers are expected to bound every call with their own timeout.

use async_trait::async_trait;
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Write rejected for {tier}/{key}: {reason}")]
    WriteRejected {
        tier: String,
        key: String,
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::WriteRejected { .. } => true,
            StoreError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            StoreError::Backend(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A stored value together with the version the store assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    /// Opaque payload
    pub bytes: Vec<u8>,

    /// Version of this value; the first write of a key is version 1
    pub version: u64,
}

impl StoredValue {
    pub fn new(bytes: Vec<u8>, version: u64) -> Self {
        Self { bytes, version }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Byte-addressable, versioned key/value store partitioned into tiers
///
/// Implementations must be `Send + Sync + 'static` so a single store can be
/// shared by the monitor loop and by direct API callers.
#[async_trait]
pub trait VersionedStore: Send + Sync + 'static {
    /// Read a key. Returns `Ok(None)` when the key does not exist.
    async fn get(&self, tier: &str, key: &str) -> Result<Option<StoredValue>>;

    /// Write a key and return the version assigned to the new value.
    async fn put(&self, tier: &str, key: &str, bytes: Vec<u8>) -> Result<u64>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, tier: &str, key: &str) -> Result<()>;

    /// List the keys of a tier in ascending order. An unknown tier is empty.
    async fn keys(&self, tier: &str) -> Result<Vec<String>>;
}
