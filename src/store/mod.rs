//! Durable Store Port
//!
//! Key -> blob persistence shared by the cold cache tier, the durable level of
//! the deduplication index and the checkpoint store. Implementations must
//! tolerate concurrent readers and converge concurrent writers to one value
//! per key (last write wins).

mod journal;
mod memory;
mod pattern;

pub use journal::JournaledStore;
pub use memory::{InMemoryDurableStore, StoreSnapshot, StoreStats};
pub use pattern::KeyPattern;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::dedup::{Digest, DigestRecord};
use crate::error::Result;

/// Durable key/value store with digest queries
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a value; expired values read as absent
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()>;

    /// Delete a value, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys matching a glob pattern
    async fn find_by_pattern(&self, pattern: &KeyPattern) -> Result<Vec<String>>;

    /// Look up the artifact recorded for a digest, optionally within one scope
    async fn query_by_digest(
        &self,
        digest: &Digest,
        scope_key: Option<&str>,
    ) -> Result<Option<DigestRecord>>;

    /// Insert or replace the record for `(digest, scope_key)` atomically
    async fn upsert_digest(&self, record: &DigestRecord) -> Result<()>;

    /// Approximate number of bytes held
    async fn approximate_size(&self) -> Result<u64>;
}
