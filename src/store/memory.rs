//! In-memory durable store
//!
//! DashMap-backed implementation of [`DurableStore`] used by tests and the
//! command-line runner. It can be snapshotted to JSON so state survives
//! between runs, and it supports fault injection (unavailability and
//! artificial latency) for exercising fail-open paths.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::{DurableStore, KeyPattern};
use crate::clock::{add_duration, Clock, SystemClock};
use crate::dedup::{Digest, DigestRecord};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredValue {
    data: Bytes,
    expires_at: Option<DateTime<Utc>>,
}

/// Operation counters
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Live keys (expired keys may be counted until touched)
    pub key_count: u64,
    /// Bytes held by values
    pub total_bytes: u64,
    /// Digest records held
    pub digest_records: u64,
    pub reads: u64,
    pub writes: u64,
    pub deletes: u64,
    pub digest_queries: u64,
}

/// Serializable image of the store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub values: Vec<SnapshotValue>,
    pub digests: Vec<DigestRecord>,
}

/// One key/value pair of a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotValue {
    pub key: String,
    pub data: Vec<u8>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// In-memory durable store
pub struct InMemoryDurableStore {
    values: DashMap<String, StoredValue>,
    /// digest -> scope -> record
    digests: DashMap<Digest, HashMap<Option<String>, DigestRecord>>,
    clock: Arc<dyn Clock>,
    total_bytes: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    digest_queries: AtomicU64,
    // Fault injection
    unavailable: AtomicBool,
    latency: RwLock<Option<Duration>>,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryDurableStore {
    /// Create an empty store on the system clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store on the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: DashMap::new(),
            digests: DashMap::new(),
            clock,
            total_bytes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            digest_queries: AtomicU64::new(0),
            unavailable: AtomicBool::new(false),
            latency: RwLock::new(None),
        }
    }

    /// Make every subsequent call fail until re-enabled
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Current counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            key_count: self.values.len() as u64,
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            digest_records: self.digests.iter().map(|e| e.value().len() as u64).sum(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            digest_queries: self.digest_queries.load(Ordering::Relaxed),
        }
    }

    /// Copy the live contents into a snapshot
    pub fn snapshot(&self) -> StoreSnapshot {
        let now = self.clock.now();
        let values = self
            .values
            .iter()
            .filter(|e| e.value().expires_at.map_or(true, |at| at > now))
            .map(|e| SnapshotValue {
                key: e.key().clone(),
                data: e.value().data.to_vec(),
                expires_at: e.value().expires_at,
            })
            .collect();
        let digests = self
            .digests
            .iter()
            .flat_map(|e| e.value().values().cloned().collect::<Vec<_>>())
            .collect();
        StoreSnapshot { values, digests }
    }

    /// Rebuild a store from a snapshot
    pub fn from_snapshot(snapshot: StoreSnapshot, clock: Arc<dyn Clock>) -> Self {
        let store = Self::with_clock(clock);
        for value in snapshot.values {
            store.restore_value(&value.key, Bytes::from(value.data), value.expires_at);
        }
        for record in snapshot.digests {
            store.insert_digest(record);
        }
        store
    }

    /// Write a JSON snapshot to disk
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_vec(&self.snapshot())?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load a JSON snapshot, or start empty if the file does not exist
    pub fn load_from_file(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::with_clock(clock));
        }
        let raw = std::fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&raw)?;
        Ok(Self::from_snapshot(snapshot, clock))
    }

    async fn simulate(&self, operation: &str) -> Result<()> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::store(operation, "store unavailable"));
        }
        Ok(())
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Insert a value with an absolute expiry, bypassing fault injection
    pub(crate) fn restore_value(&self, key: &str, data: Bytes, expires_at: Option<DateTime<Utc>>) {
        let size = data.len() as u64;
        let old = self
            .values
            .insert(key.to_string(), StoredValue { data, expires_at });
        if let Some(old) = old {
            self.total_bytes
                .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
        }
        self.total_bytes.fetch_add(size, Ordering::Relaxed);
    }

    /// Write a value with an absolute expiry
    pub(crate) async fn set_until(
        &self,
        key: &str,
        value: Bytes,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.simulate("set").await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.restore_value(key, value, expires_at);
        Ok(())
    }

    pub(crate) fn remove_value(&self, key: &str) -> bool {
        match self.values.remove(key) {
            Some((_, old)) => {
                self.total_bytes
                    .fetch_sub(old.data.len() as u64, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub(crate) fn insert_digest(&self, record: DigestRecord) {
        self.digests
            .entry(record.digest)
            .or_default()
            .insert(record.scope_key.clone(), record);
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.simulate("get").await?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let expired = match self.values.get(key) {
            Some(value) if value.expires_at.map_or(true, |at| at > now) => {
                return Ok(Some(value.data.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove_value(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| add_duration(self.clock.now(), ttl));
        self.set_until(key, value, expires_at).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.simulate("delete").await?;
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(self.remove_value(key))
    }

    async fn find_by_pattern(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        self.simulate("find_by_pattern").await?;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.value().expires_at.map_or(true, |at| at > now))
            .filter(|e| pattern.matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn query_by_digest(
        &self,
        digest: &Digest,
        scope_key: Option<&str>,
    ) -> Result<Option<DigestRecord>> {
        self.simulate("query_by_digest").await?;
        self.digest_queries.fetch_add(1, Ordering::Relaxed);

        let Some(scopes) = self.digests.get(digest) else {
            return Ok(None);
        };
        let found = match scope_key {
            Some(scope) => scopes.get(&Some(scope.to_string())).cloned(),
            // Unscoped queries match any scope; prefer the unscoped record,
            // then the lowest order hint.
            None => scopes.get(&None).cloned().or_else(|| {
                scopes
                    .values()
                    .min_by(|a, b| {
                        a.order_hint
                            .cmp(&b.order_hint)
                            .then_with(|| a.scope_key.cmp(&b.scope_key))
                    })
                    .cloned()
            }),
        };
        Ok(found)
    }

    async fn upsert_digest(&self, record: &DigestRecord) -> Result<()> {
        self.simulate("upsert_digest").await?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.insert_digest(record.clone());
        Ok(())
    }

    async fn approximate_size(&self) -> Result<u64> {
        self.simulate("approximate_size").await?;
        Ok(self.total_bytes.load(Ordering::Relaxed))
    }
}

// =============================================================================
// Tests
// =============================================================================
