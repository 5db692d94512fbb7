//! Storage primitives shared across the core: a redb-backed KV store, a
//! two-level LRU/TTL cache, and the vector-store seam.

mod cache;
mod kv;
mod vector;

pub use cache::{CacheStats, TieredCache, TieredCacheConfig};
pub use kv::KvStore;
pub use vector::{
    FilterValue, MemoryVectorStore, VectorMatch, VectorRecord, VectorStore, WhereFilter,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unknown collection: {0}")]
    UnknownCollection(String),
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        Self::Backend(err.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        Self::Backend(err.to_string())
    }
}
