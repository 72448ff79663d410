//! Cold Tier - durable-store backed cache
//!
//! Entries are stored under `cache:<key>` as a small framed record:
//!
//! ```text
//! [header_len: u32 LE][header: JSON][value bytes]
//! ```
//!
//! The header carries the entry timestamps so TTL and recency survive a
//! round trip through the store. Every store call is bounded by the
//! configured timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::entry::{CacheEntry, CacheTier};
use crate::error::{Error, Result};
use crate::store::{DurableStore, KeyPattern};

/// Store key prefix for cold cache entries
pub const COLD_KEY_PREFIX: &str = "cache:";

#[derive(Debug, Serialize, Deserialize)]
struct ColdHeader {
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    last_access_at: DateTime<Utc>,
}

/// Durable-store backed tier
pub struct ColdTier {
    store: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl ColdTier {
    pub fn new(store: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    fn store_key(key: &str) -> String {
        format!("{}{}", COLD_KEY_PREFIX, key)
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::StoreTimeout {
                operation: operation.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }

    /// Read an entry; expired entries read as absent
    pub async fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>> {
        let raw = self
            .bounded("cold_get", self.store.get(&Self::store_key(key)))
            .await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry = decode(key, raw)?;
        Ok((!entry.is_expired(now)).then_some(entry))
    }

    /// Write an entry with its remaining TTL
    ///
    /// Entries already expired at `now` are not written.
    pub async fn put(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Result<bool> {
        if entry.is_expired(now) {
            return Ok(false);
        }
        let ttl = entry.remaining_ttl(now);
        let framed = encode(entry)?;
        self.bounded(
            "cold_set",
            self.store.set(&Self::store_key(&entry.key), framed, ttl),
        )
        .await?;
        Ok(true)
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.bounded("cold_delete", self.store.delete(&Self::store_key(key)))
            .await
    }

    /// Cache keys (without the store prefix) matching a pattern
    pub async fn keys_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        let scoped = pattern.prefixed(COLD_KEY_PREFIX)?;
        let keys = self
            .bounded("cold_find", self.store.find_by_pattern(&scoped))
            .await?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(COLD_KEY_PREFIX).map(str::to_string))
            .collect())
    }

    /// Approximate bytes held by the backing store
    pub async fn approximate_size(&self) -> Result<u64> {
        self.bounded("cold_size", self.store.approximate_size())
            .await
    }
}

fn encode(entry: &CacheEntry) -> Result<Bytes> {
    let header = serde_json::to_vec(&ColdHeader {
        created_at: entry.created_at,
        expires_at: entry.expires_at,
        last_access_at: entry.last_access_at,
    })?;
    let mut buf = BytesMut::with_capacity(4 + header.len() + entry.value.len());
    buf.put_u32_le(header.len() as u32);
    buf.put_slice(&header);
    buf.put_slice(&entry.value);
    Ok(buf.freeze())
}

fn decode(key: &str, raw: Bytes) -> Result<CacheEntry> {
    let corrupt = |reason: &str| Error::store("cold_get", format!("{}: {}", key, reason));

    if raw.len() < 4 {
        return Err(corrupt("truncated frame"));
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&raw[..4]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if raw.len() < 4 + header_len {
        return Err(corrupt("truncated header"));
    }
    let header: ColdHeader = serde_json::from_slice(&raw[4..4 + header_len])
        .map_err(|e| corrupt(&e.to_string()))?;
    let value = raw.slice(4 + header_len..);

    Ok(CacheEntry {
        key: key.to_string(),
        size_bytes: value.len() as u64,
        value,
        created_at: header.created_at,
        expires_at: header.expires_at,
        last_access_at: header.last_access_at,
        tier: CacheTier::Cold,
    })
}
