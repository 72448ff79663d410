//! Content-Addressed Deduplication Index
//!
//! Prevents re-storing binary assets whose content has already been stored.
//! Content is hashed to a [`Digest`] and looked up through an ordered list of
//! [`DigestLookup`] levels; the first level that knows the digest wins and
//! the faster levels in front of it are backfilled.
//!
//! Infrastructure failures (including the bounded lookup timeout) are
//! treated as "not yet seen": processing a duplicate as new is preferable to
//! stalling the pipeline.

mod digest;
mod levels;

pub use digest::{DedupKey, Digest, DigestRecord, DIGEST_LEN};
pub use levels::{DigestLookup, DurableDigestLookup, LocalDigestMap, SharedDigestMap};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::DedupSettings;
use crate::error::Result;
use crate::store::DurableStore;

/// Result of a content lookup
#[derive(Debug, Clone)]
pub struct DedupLookup {
    /// Digest of the looked-up content
    pub digest: Digest,
    /// Matching record, if the content was seen before
    pub record: Option<DigestRecord>,
    /// Level that answered
    pub level: Option<&'static str>,
}

impl DedupLookup {
    pub fn is_hit(&self) -> bool {
        self.record.is_some()
    }

    pub fn artifact_ref(&self) -> Option<&str> {
        self.record.as_ref().map(|r| r.artifact_ref.as_str())
    }
}

/// Lookup counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    /// Hits per level, in lookup order
    pub hits: Vec<(String, u64)>,
    pub misses: u64,
    /// Level failures and timeouts treated as misses
    pub failures: u64,
    pub recorded: u64,
}

/// Multi-level digest index
pub struct DedupIndex {
    levels: Vec<Arc<dyn DigestLookup>>,
    hits: Vec<AtomicU64>,
    misses: AtomicU64,
    failures: AtomicU64,
    recorded: AtomicU64,
}

impl DedupIndex {
    /// Standard three-level index: in-process, shared, durable
    pub fn new(
        store: Arc<dyn DurableStore>,
        shared: Arc<SharedDigestMap>,
        settings: &DedupSettings,
    ) -> Self {
        let local: Arc<dyn DigestLookup> = Arc::new(LocalDigestMap::new());
        let durable: Arc<dyn DigestLookup> =
            Arc::new(DurableDigestLookup::new(store, settings.lookup_timeout()));
        Self::with_levels(vec![local, shared, durable])
    }

    /// Index over a custom ordered list of levels
    pub fn with_levels(levels: Vec<Arc<dyn DigestLookup>>) -> Self {
        let hits = levels.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            levels,
            hits,
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            recorded: AtomicU64::new(0),
        }
    }

    /// Reset per-run state (clears the in-process level)
    pub fn begin_run(&self) {
        for level in &self.levels {
            level.begin_run();
        }
    }

    /// Hash content and look it up
    pub async fn lookup(&self, content: &[u8], scope_key: Option<&str>) -> DedupLookup {
        let digest = Digest::of(content);
        let (record, level) = self.lookup_key(&DedupKey::new(digest, scope_key)).await;
        DedupLookup {
            digest,
            record,
            level,
        }
    }

    /// Look up an already computed digest
    pub async fn lookup_digest(
        &self,
        digest: &Digest,
        scope_key: Option<&str>,
    ) -> Option<DigestRecord> {
        self.lookup_key(&DedupKey::new(*digest, scope_key)).await.0
    }

    async fn lookup_key(&self, key: &DedupKey) -> (Option<DigestRecord>, Option<&'static str>) {
        for (idx, level) in self.levels.iter().enumerate() {
            match level.find(key).await {
                Ok(Some(record)) => {
                    self.hits[idx].fetch_add(1, Ordering::Relaxed);
                    trace!(digest = %key.digest.short(), level = level.name(), "Digest hit");
                    self.backfill(idx, key, &record).await;
                    return (Some(record), Some(level.name()));
                }
                Ok(None) => {}
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        digest = %key.digest.short(),
                        level = level.name(),
                        error = %e,
                        "Digest lookup failed, treating as not seen"
                    );
                }
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        (None, None)
    }

    /// Copy a hit into every faster level
    async fn backfill(&self, found_at: usize, key: &DedupKey, record: &DigestRecord) {
        for level in &self.levels[..found_at] {
            if let Err(e) = level.remember(key, record).await {
                debug!(level = level.name(), error = %e, "Digest backfill failed");
            }
        }
    }

    /// Record a newly stored artifact in every level
    ///
    /// A failing level is logged and skipped; the remaining levels still
    /// learn the digest.
    pub async fn record(
        &self,
        digest: Digest,
        scope_key: Option<&str>,
        artifact_ref: &str,
        order_hint: i32,
    ) -> DigestRecord {
        let record = DigestRecord::new(
            digest,
            scope_key.map(str::to_string),
            artifact_ref,
            order_hint,
        );
        self.write_through(&record).await;
        self.recorded.fetch_add(1, Ordering::Relaxed);
        debug!(
            digest = %digest.short(),
            scope = scope_key.unwrap_or("-"),
            artifact = artifact_ref,
            "Recorded digest"
        );
        record
    }

    /// Update the order hint of an existing record
    ///
    /// Returns `false` if no record exists for the key.
    pub async fn set_order_hint(
        &self,
        digest: &Digest,
        scope_key: Option<&str>,
        order_hint: i32,
    ) -> Result<bool> {
        let key = DedupKey::new(*digest, scope_key);
        let Some(mut record) = self.lookup_key(&key).await.0 else {
            return Ok(false);
        };
        // Only the exact (digest, scope) record may be mutated
        if record.scope_key != key.scope_key {
            return Ok(false);
        }
        record.order_hint = order_hint;
        self.write_through(&record).await;
        Ok(true)
    }

    async fn write_through(&self, record: &DigestRecord) {
        let key = record.key();
        // Durable level last in the list, but written first: it is the
        // source of truth.
        for level in self.levels.iter().rev() {
            if let Err(e) = level.remember(&key, record).await {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    digest = %record.digest.short(),
                    level = level.name(),
                    error = %e,
                    "Failed to record digest"
                );
            }
        }
    }

    /// Counter snapshot
    pub fn stats(&self) -> DedupStats {
        DedupStats {
            hits: self
                .levels
                .iter()
                .zip(&self.hits)
                .map(|(level, hits)| (level.name().to_string(), hits.load(Ordering::Relaxed)))
                .collect(),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            recorded: self.recorded.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDurableStore;
    use std::time::Duration;

    fn index_with(store: Arc<InMemoryDurableStore>) -> (DedupIndex, Arc<SharedDigestMap>) {
        let settings = DedupSettings::default();
        let shared = SharedDigestMap::from_settings(&settings);
        (DedupIndex::new(store, shared.clone(), &settings), shared)
    }

    #[tokio::test]
    async fn test_lookup_twice_before_record_misses() {
        let (index, _) = index_with(Arc::new(InMemoryDurableStore::new()));

        assert!(!index.lookup(b"content-x", None).await.is_hit());
        assert!(!index.lookup(b"content-x", None).await.is_hit());
        assert_eq!(index.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_record_then_lookup_by_content_and_digest() {
        let (index, _) = index_with(Arc::new(InMemoryDurableStore::new()));

        let miss = index.lookup(b"content-x", None).await;
        index.record(miss.digest, None, "ref-1", 0).await;

        let by_content = index.lookup(b"content-x", None).await;
        assert_eq!(by_content.artifact_ref(), Some("ref-1"));

        let rederived = Digest::parse(&miss.digest.to_hex()).unwrap();
        let by_digest = index.lookup_digest(&rederived, None).await.unwrap();
        assert_eq!(by_digest.artifact_ref, "ref-1");
    }

    #[tokio::test]
    async fn test_scope_is_respected() {
        let (index, _) = index_with(Arc::new(InMemoryDurableStore::new()));

        let digest = Digest::of(b"content-x");
        index.record(digest, Some("42"), "ref1", 0).await;

        let same_scope = index.lookup(b"content-x", Some("42")).await;
        assert_eq!(same_scope.artifact_ref(), Some("ref1"));

        let other_scope = index.lookup(b"content-x", Some("99")).await;
        assert!(!other_scope.is_hit());
    }

    #[tokio::test]
    async fn test_durable_hit_backfills_memory_levels() {
        let store = Arc::new(InMemoryDurableStore::new());
        let (first, _) = index_with(store.clone());
        let digest = Digest::of(b"content-y");
        first.record(digest, None, "ref-y", 0).await;

        // Fresh process: new local and shared maps over the same store
        let (second, shared) = index_with(store.clone());
        let hit = second.lookup(b"content-y", None).await;
        assert_eq!(hit.level, Some("durable"));
        assert!(shared.contains(&DedupKey::new(digest, None)));

        let again = second.lookup(b"content-y", None).await;
        assert_eq!(again.level, Some("local"));
    }

    #[tokio::test]
    async fn test_begin_run_falls_back_to_shared() {
        let (index, _) = index_with(Arc::new(InMemoryDurableStore::new()));
        let digest = Digest::of(b"content-z");
        index.record(digest, None, "ref-z", 0).await;

        index.begin_run();
        let hit = index.lookup(b"content-z", None).await;
        assert_eq!(hit.level, Some("shared"));
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let store = Arc::new(InMemoryDurableStore::new());
        let (index, _) = index_with(store.clone());
        store.set_available(false);

        let lookup = index.lookup(b"content", None).await;
        assert!(!lookup.is_hit());
        assert_eq!(index.stats().failures, 1);

        // Record still lands in the memory levels
        index.record(lookup.digest, None, "ref", 0).await;
        assert_eq!(index.lookup(b"content", None).await.level, Some("local"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_lookup_returns_not_found() {
        let store = Arc::new(InMemoryDurableStore::new());
        let settings = DedupSettings {
            lookup_timeout_ms: 5_000,
            ..Default::default()
        };
        let index = DedupIndex::new(
            store.clone(),
            SharedDigestMap::from_settings(&settings),
            &settings,
        );
        store.set_latency(Some(Duration::from_secs(3_600)));

        let lookup = index.lookup(b"content", None).await;
        assert!(!lookup.is_hit());
        assert_eq!(index.stats().failures, 1);
    }

    #[tokio::test]
    async fn test_set_order_hint() {
        let store = Arc::new(InMemoryDurableStore::new());
        let (index, _) = index_with(store.clone());
        let digest = Digest::of(b"gallery-image");
        index.record(digest, Some("7"), "ref", 0).await;

        assert!(index.set_order_hint(&digest, Some("7"), 3).await.unwrap());
        let durable = store
            .query_by_digest(&digest, Some("7"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(durable.order_hint, 3);

        assert!(!index
            .set_order_hint(&Digest::of(b"unknown"), Some("7"), 1)
            .await
            .unwrap());
    }
}
