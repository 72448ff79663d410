//! Digest lookup levels
//!
//! The index consults an ordered list of [`DigestLookup`] levels, cheapest
//! first:
//!
//! ```text
//! LocalDigestMap (per run) → SharedDigestMap (bounded, FIFO) → DurableDigestLookup
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::digest::{DedupKey, DigestRecord};
use crate::config::DedupSettings;
use crate::error::{Error, Result};
use crate::store::DurableStore;

/// One level of the multi-level digest lookup
#[async_trait]
pub trait DigestLookup: Send + Sync {
    /// Short level name for logs and stats
    fn name(&self) -> &'static str;

    /// Find the record for a key
    async fn find(&self, key: &DedupKey) -> Result<Option<DigestRecord>>;

    /// Remember a record under the given key
    async fn remember(&self, key: &DedupKey, record: &DigestRecord) -> Result<()>;

    /// Called when a new job run starts
    fn begin_run(&self) {}
}

// =============================================================================
// In-process level
// =============================================================================

/// Unbounded per-run digest map, cleared at the start of every run
#[derive(Debug, Default)]
pub struct LocalDigestMap {
    entries: Mutex<HashMap<DedupKey, DigestRecord>>,
}

impl LocalDigestMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl DigestLookup for LocalDigestMap {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn find(&self, key: &DedupKey) -> Result<Option<DigestRecord>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn remember(&self, key: &DedupKey, record: &DigestRecord) -> Result<()> {
        self.entries.lock().insert(key.clone(), record.clone());
        Ok(())
    }

    fn begin_run(&self) {
        let mut entries = self.entries.lock();
        entries.clear();
        entries.shrink_to_fit();
    }
}

// =============================================================================
// Shared cross-job level
// =============================================================================

#[derive(Debug, Default)]
struct SharedInner {
    entries: HashMap<DedupKey, DigestRecord>,
    /// Insertion order, oldest first
    order: VecDeque<DedupKey>,
}

/// Bounded digest map shared by every job in the process
///
/// When full, the oldest `evict_fraction` of entries are dropped in
/// insertion order.
#[derive(Debug)]
pub struct SharedDigestMap {
    inner: Mutex<SharedInner>,
    capacity: usize,
    evict_fraction: f64,
}

impl SharedDigestMap {
    pub fn new(capacity: usize, evict_fraction: f64) -> Self {
        Self {
            inner: Mutex::new(SharedInner::default()),
            capacity: capacity.max(1),
            evict_fraction: evict_fraction.clamp(f64::EPSILON, 1.0),
        }
    }

    pub fn from_settings(settings: &DedupSettings) -> Arc<Self> {
        Arc::new(Self::new(
            settings.shared_capacity,
            settings.shared_evict_fraction,
        ))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    fn evict_oldest(&self, inner: &mut SharedInner) -> usize {
        let batch = ((self.capacity as f64) * self.evict_fraction).ceil() as usize;
        let mut evicted = 0;
        while evicted < batch {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

#[async_trait]
impl DigestLookup for SharedDigestMap {
    fn name(&self) -> &'static str {
        "shared"
    }

    async fn find(&self, key: &DedupKey) -> Result<Option<DigestRecord>> {
        Ok(self.inner.lock().entries.get(key).cloned())
    }

    async fn remember(&self, key: &DedupKey, record: &DigestRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(key) {
            inner.entries.insert(key.clone(), record.clone());
            return Ok(());
        }
        if inner.entries.len() >= self.capacity {
            let evicted = self.evict_oldest(&mut inner);
            debug!(evicted, capacity = self.capacity, "Shared digest map full, evicted oldest entries");
        }
        inner.entries.insert(key.clone(), record.clone());
        inner.order.push_back(key.clone());
        Ok(())
    }
}

// =============================================================================
// Durable level
// =============================================================================

/// Digest queries against the durable store, bounded by a timeout
pub struct DurableDigestLookup {
    store: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl DurableDigestLookup {
    pub fn new(store: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }
}

#[async_trait]
impl DigestLookup for DurableDigestLookup {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn find(&self, key: &DedupKey) -> Result<Option<DigestRecord>> {
        tokio::time::timeout(
            self.timeout,
            self.store.query_by_digest(&key.digest, key.scope()),
        )
        .await
        .map_err(|_| Error::StoreTimeout {
            operation: "query_by_digest".to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        })?
    }

    async fn remember(&self, _key: &DedupKey, record: &DigestRecord) -> Result<()> {
        tokio::time::timeout(self.timeout, self.store.upsert_digest(record))
            .await
            .map_err(|_| Error::StoreTimeout {
                operation: "upsert_digest".to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }
}

// =============================================================================
// Tests
// =============================================================================
