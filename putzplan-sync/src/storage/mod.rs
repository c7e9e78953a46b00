//! Local persistence for the shopping list.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  snapshot  ┌──────────────────┐  write(key)  ┌──────────────┐
//! │ LocalCache  │ ─────────► │                  │ ───────────► │ RocksStorage │
//! └─────────────┘            │ snapshot codec   │              │ (or memory)  │
//! ┌─────────────┐  snapshot  │ bincode + LZ4 +  │  read(key)   │              │
//! │ MutationQ.  │ ─────────► │ checksum         │ ◄─────────── │              │
//! └─────────────┘            └──────────────────┘              └──────────────┘
//! ```
//!
//! Two logical keys exist per household: the cache snapshot and the queue
//! snapshot. Every write replaces the whole value.

pub mod memory;
pub mod rocks;
pub mod snapshot;

pub use memory::MemoryStorage;
pub use rocks::{RocksStorage, StoreConfig};
pub use snapshot::SnapshotKind;

use uuid::Uuid;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("snapshot checksum mismatch for {kind:?}")]
    ChecksumMismatch { kind: SnapshotKind },
    #[error("snapshot belongs to household {found}, expected {expected}")]
    WrongScope { expected: Uuid, found: Uuid },
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Key/value persistence consumed by the cache and the queue.
///
/// Writes are synchronous: when `write` returns `Ok`, the value must survive
/// a process restart.
pub trait Storage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    fn write(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
}

/// Storage key of the cache snapshot for a household.
pub fn cache_key(household_id: Uuid) -> String {
    format!("shopping/{household_id}/cache")
}

/// Storage key of the queue snapshot for a household.
pub fn queue_key(household_id: Uuid) -> String {
    format!("shopping/{household_id}/queue")
}
