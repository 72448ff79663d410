//! Cache Store - two-tier cache orchestration
//!
//! Combines the bounded [`HotTier`] with the durable [`ColdTier`]:
//!
//! - placement on write through a [`PlacementPolicy`]
//! - promotion of cold hits the policy admits to the hot tier
//! - demotion of idle (or all) hot entries under pressure
//! - segmented bulk invalidation across both tiers
//!
//! A key lives in at most one tier. Moves remove the source copy before the
//! destination copy becomes visible. Durable-store failures never surface to
//! callers: reads degrade to misses and writes to "not cached". A cold copy
//! that could not be removed while the store was down is remembered as
//! superseded and deleted before the cold tier is read for that key again.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace, warn};

use super::cold::ColdTier;
use super::entry::{CacheEntry, CacheTier};
use super::flush::{FlushPacer, FlushReport};
use super::hot::HotTier;
use super::metrics::{CacheMetrics, CacheStats};
use super::policy::{PlacementPolicy, ThresholdPlacement, TierBudget};
use crate::clock::{Clock, SystemClock};
use crate::config::{CacheSettings, FlushSettings, TtlTable};
use crate::error::Error;
use crate::pressure::MemorySampler;
use crate::store::{DurableStore, KeyPattern};

/// TTL selection for a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ttl {
    /// Use the TTL configured for the key's class
    #[default]
    ClassDefault,
    /// Explicit TTL
    Fixed(Duration),
    /// Never expires
    Never,
}

/// Options for [`CacheStore::set`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub ttl: Ttl,
    /// Size used for placement; defaults to the value length
    pub size_hint: Option<u64>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Ttl::Fixed(ttl),
            ..Default::default()
        }
    }

    pub fn size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }
}

/// A cache hit
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub value: Bytes,
    /// Tier that served the read
    pub tier: CacheTier,
    /// Whether the read moved the entry to the hot tier
    pub promoted: bool,
}

/// Which hot entries a demotion moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemotionMode {
    /// Entries idle for at least this long
    Aged(Duration),
    /// Every hot entry
    All,
}

/// Outcome of a demotion pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemotionReport {
    pub moved: usize,
    /// Entries found expired and dropped instead of moved
    pub expired: usize,
    /// Entries kept hot because the cold write failed
    pub retained: usize,
}

/// Outcome of a TTL purge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub entries: usize,
    pub bytes: u64,
}

/// Two-tier cache
pub struct CacheStore {
    hot: HotTier,
    cold: ColdTier,
    placement: Arc<dyn PlacementPolicy>,
    ttl: TtlTable,
    flush: FlushSettings,
    demote_after: Duration,
    clock: Arc<dyn Clock>,
    sampler: Option<Arc<dyn MemorySampler>>,
    metrics: CacheMetrics,
    /// Keys whose cold copy is superseded but could not be deleted yet
    stale_cold: Mutex<HashSet<String>>,
}

impl CacheStore {
    /// Create a cache over a durable store using the system clock and
    /// threshold placement
    pub fn new(settings: &CacheSettings, store: Arc<dyn DurableStore>) -> Self {
        Self {
            hot: HotTier::new(TierBudget::from_settings(&settings.hot)),
            cold: ColdTier::new(store, settings.store_timeout()),
            placement: Arc::new(ThresholdPlacement::from_settings(&settings.hot)),
            ttl: settings.ttl.clone(),
            flush: settings.flush.clone(),
            demote_after: settings.demote_after(),
            clock: Arc::new(SystemClock),
            sampler: None,
            metrics: CacheMetrics::new(),
            stale_cold: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementPolicy>) -> Self {
        self.placement = placement;
        self
    }

    /// Memory sampler consulted between flush segments
    pub fn with_memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    fn store_failed(&self, operation: &str, key: &str, error: &Error) {
        self.metrics.record_store_error();
        warn!(operation, key, error = %error, "Cold tier unavailable, failing open");
    }

    fn mark_cold_stale(&self, key: &str) {
        self.stale_cold.lock().insert(key.to_string());
    }

    fn clear_cold_stale(&self, key: &str) {
        self.stale_cold.lock().remove(key);
    }

    /// Delete a superseded cold copy before the cold tier is read
    ///
    /// Returns `false` while the copy may still be there.
    async fn reconcile_cold(&self, key: &str) -> bool {
        if !self.stale_cold.lock().contains(key) {
            return true;
        }
        match self.cold.delete(key).await {
            Ok(_) => {
                self.clear_cold_stale(key);
                debug!(key, "Removed superseded cold copy");
                true
            }
            Err(e) => {
                self.store_failed("reconcile", key, &e);
                false
            }
        }
    }

    /// Keys with a superseded cold copy still pending deletion
    pub fn stale_cold_keys(&self) -> usize {
        self.stale_cold.lock().len()
    }

    fn account_evictions(&self, evicted: &[CacheEntry]) {
        if evicted.is_empty() {
            return;
        }
        self.metrics.record_evictions(evicted.len());
        debug!(
            count = evicted.len(),
            freed_bytes = evicted.iter().map(|e| e.size_bytes).sum::<u64>(),
            hot_bytes = self.hot.used_bytes(),
            "Evicted hot entries"
        );
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read a key, promoting admitted cold hits to the hot tier
    pub async fn get(&self, key: &str) -> Option<CacheHit> {
        let now = self.clock.now();

        match self.hot.get(key, now) {
            Ok(Some(entry)) => {
                self.metrics.record_hot_hit();
                trace!(key, "Hot hit");
                return Some(CacheHit {
                    value: entry.value,
                    tier: CacheTier::Hot,
                    promoted: false,
                });
            }
            Ok(None) => {}
            Err(_expired) => {
                // Exclusive tiers: an expired hot copy means no cold copy
                self.metrics.record_expirations(1);
                self.metrics.record_miss();
                return None;
            }
        }

        if !self.reconcile_cold(key).await {
            self.metrics.record_miss();
            return None;
        }
        let entry = match self.cold.get(key, now).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.metrics.record_miss();
                return None;
            }
            Err(e) => {
                self.store_failed("get", key, &e);
                self.metrics.record_miss();
                return None;
            }
        };
        self.metrics.record_cold_hit();

        let promoted = self.promote(entry.clone(), now).await;
        Some(CacheHit {
            value: entry.value,
            tier: CacheTier::Cold,
            promoted,
        })
    }

    async fn promote(&self, mut entry: CacheEntry, now: chrono::DateTime<chrono::Utc>) -> bool {
        if !self.placement.should_use_hot_cache(&entry.key, entry.size_bytes) {
            return false;
        }
        match self.cold.delete(&entry.key).await {
            Ok(_) => {
                entry.touch(now);
                let key = entry.key.clone();
                let outcome = self.hot.insert(entry);
                self.account_evictions(&outcome.evicted);
                self.metrics.record_promotion();
                trace!(key = %key, "Promoted to hot tier");
                true
            }
            Err(e) => {
                self.store_failed("promote", &entry.key, &e);
                false
            }
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn resolve_ttl(&self, key: &str, ttl: Ttl) -> Option<Duration> {
        match ttl {
            Ttl::ClassDefault => self.ttl.ttl_for(key),
            Ttl::Fixed(ttl) => Some(ttl),
            Ttl::Never => None,
        }
    }

    /// Write a key into the tier chosen by the placement policy
    ///
    /// Returns the tier written, or `None` when the cold write failed and
    /// the value is not cached. A hot write whose cold copy cannot be
    /// deleted still succeeds; the cold copy is marked superseded.
    pub async fn set(&self, key: &str, value: Bytes, options: SetOptions) -> Option<CacheTier> {
        let now = self.clock.now();
        let size = options.size_hint.unwrap_or(value.len() as u64);
        let ttl = self.resolve_ttl(key, options.ttl);

        if self.placement.should_use_hot_cache(key, size) {
            match self.cold.delete(key).await {
                Ok(_) => self.clear_cold_stale(key),
                Err(e) => {
                    self.store_failed("set", key, &e);
                    self.mark_cold_stale(key);
                }
            }
            let entry = CacheEntry::new(key, value, ttl, now, CacheTier::Hot);
            let outcome = self.hot.insert(entry);
            self.account_evictions(&outcome.evicted);
            trace!(key, size, "Cached in hot tier");
            return Some(CacheTier::Hot);
        }

        self.hot.remove(key);
        let entry = CacheEntry::new(key, value, ttl, now, CacheTier::Cold);
        match self.cold.put(&entry, now).await {
            Ok(_) => {
                self.clear_cold_stale(key);
                trace!(key, size, "Cached in cold tier");
                Some(CacheTier::Cold)
            }
            Err(e) => {
                self.store_failed("set", key, &e);
                self.mark_cold_stale(key);
                None
            }
        }
    }

    /// Remove a key from both tiers; absent keys are not an error
    pub async fn delete(&self, key: &str) -> bool {
        let in_hot = self.hot.remove(key).is_some();
        let in_cold = match self.cold.delete(key).await {
            Ok(found) => {
                self.clear_cold_stale(key);
                found
            }
            Err(e) => {
                self.store_failed("delete", key, &e);
                self.mark_cold_stale(key);
                false
            }
        };
        in_hot || in_cold
    }

    // =========================================================================
    // Bulk invalidation
    // =========================================================================

    /// Delete every key matching a glob in both tiers
    ///
    /// Matches are processed in segments of `flush.segment_size`; above the
    /// flush threshold the sweep yields between segments when the time or
    /// memory budget is exceeded.
    #[instrument(skip_all, fields(pattern = %pattern))]
    pub async fn delete_by_pattern(&self, pattern: &KeyPattern) -> FlushReport {
        let mut keys: BTreeSet<String> = self.hot.keys_matching(pattern).into_iter().collect();
        match self.cold.keys_matching(pattern).await {
            Ok(cold_keys) => keys.extend(cold_keys),
            Err(e) => self.store_failed("delete_by_pattern", pattern.as_str(), &e),
        }
        let keys: Vec<String> = keys.into_iter().collect();

        let mut pacer = FlushPacer::new(&self.flush, self.sampler.as_deref(), keys.len());
        let mut report = FlushReport {
            matched: keys.len(),
            ..Default::default()
        };

        for segment in keys.chunks(pacer.segment_size()) {
            pacer.begin_segment();
            for key in segment {
                let in_hot = self.hot.remove(key).is_some();
                let in_cold = match self.cold.delete(key).await {
                    Ok(found) => {
                        self.clear_cold_stale(key);
                        found
                    }
                    Err(e) => {
                        self.store_failed("delete_by_pattern", key, &e);
                        self.mark_cold_stale(key);
                        report.failed += 1;
                        false
                    }
                };
                if in_hot || in_cold {
                    report.deleted += 1;
                }
            }
            report.segments += 1;
            pacer.end_segment().await;
        }
        report.yields = pacer.yields();

        info!(
            matched = report.matched,
            deleted = report.deleted,
            segments = report.segments,
            yields = report.yields,
            "Bulk invalidation complete"
        );
        report
    }

    /// Delete every cached key, segmented
    pub async fn clear_all(&self) -> FlushReport {
        self.delete_by_pattern(&KeyPattern::any()).await
    }

    // =========================================================================
    // Pressure handling
    // =========================================================================

    /// Move hot entries into the cold tier
    #[instrument(skip(self))]
    pub async fn demote(&self, mode: DemotionMode) -> DemotionReport {
        let now = self.clock.now();
        let candidates = match mode {
            DemotionMode::Aged(min_idle) => self.hot.take_idle(min_idle, now),
            DemotionMode::All => self.hot.drain(),
        };

        let mut report = DemotionReport::default();
        for entry in candidates {
            match self.cold.put(&entry, now).await {
                Ok(true) => {
                    self.clear_cold_stale(&entry.key);
                    report.moved += 1;
                }
                Ok(false) => report.expired += 1,
                Err(e) => {
                    self.store_failed("demote", &entry.key, &e);
                    let outcome = self.hot.insert(entry);
                    self.account_evictions(&outcome.evicted);
                    report.retained += 1;
                }
            }
        }
        self.metrics.record_demotions(report.moved);
        self.metrics.record_expirations(report.expired);

        if report.moved > 0 || report.retained > 0 {
            debug!(
                moved = report.moved,
                expired = report.expired,
                retained = report.retained,
                hot_bytes = self.hot.used_bytes(),
                "Demoted hot entries"
            );
        }
        report
    }

    /// Demote entries idle longer than the configured age
    pub async fn demote_aged(&self) -> DemotionReport {
        self.demote(DemotionMode::Aged(self.demote_after)).await
    }

    /// Drop expired hot entries
    pub fn purge_expired(&self) -> PurgeReport {
        let purged = self.hot.purge_expired(self.clock.now());
        self.metrics.record_expirations(purged.len());
        PurgeReport {
            entries: purged.len(),
            bytes: purged.iter().map(|e| e.size_bytes).sum(),
        }
    }

    /// Enforce a temporary hot budget of `ratio * max_bytes`
    ///
    /// Returns the number of entries evicted to meet it.
    pub fn tighten_hot_budget(&self, ratio: f64) -> usize {
        let tight = self.hot.base_budget().scaled(ratio);
        let evicted = self.hot.set_budget_override(Some(tight));
        self.account_evictions(&evicted);
        info!(
            max_bytes = tight.max_bytes,
            evicted = evicted.len(),
            "Hot budget tightened"
        );
        evicted.len()
    }

    /// Restore the configured hot budget
    pub fn relax_hot_budget(&self) {
        if self.hot.budget() != self.hot.base_budget() {
            self.hot.set_budget_override(None);
            info!(max_bytes = self.hot.base_budget().max_bytes, "Hot budget restored");
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Tiers currently holding a key
    pub async fn tiers_holding(&self, key: &str) -> Vec<CacheTier> {
        let mut tiers = Vec::with_capacity(2);
        if self.hot.contains(key) {
            tiers.push(CacheTier::Hot);
        }
        if !self.reconcile_cold(key).await {
            return tiers;
        }
        if let Ok(Some(_)) = self.cold.get(key, self.clock.now()).await {
            tiers.push(CacheTier::Cold);
        }
        tiers
    }

    pub fn hot_bytes(&self) -> u64 {
        self.hot.used_bytes()
    }

    pub fn stats(&self) -> CacheStats {
        self.metrics.snapshot(
            self.hot.used_bytes(),
            self.hot.len(),
            self.hot.budget().max_bytes,
        )
    }
}

// =============================================================================
// Tests
// =============================================================================
