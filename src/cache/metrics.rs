//! Cache Metrics Collection

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Atomic counters shared by the cache operations
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hot_hits: AtomicU64,
    cold_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    promotions: AtomicU64,
    demotions: AtomicU64,
    expirations: AtomicU64,
    store_errors: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hot_hit(&self) {
        self.hot_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cold_hit(&self) {
        self.cold_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: usize) {
        self.evictions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_promotion(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotions(&self, count: usize) {
        self.demotions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_expirations(&self, count: usize) {
        self.expirations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = (self.hot_hits.load(Ordering::Relaxed)
            + self.cold_hits.load(Ordering::Relaxed)) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Snapshot combined with the current hot tier occupancy
    pub fn snapshot(&self, hot_bytes: u64, hot_entries: usize, hot_budget: u64) -> CacheStats {
        CacheStats {
            hot_bytes,
            hot_entries,
            hot_budget_bytes: hot_budget,
            hot_hits: self.hot_hits.load(Ordering::Relaxed),
            cold_hits: self.cold_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            demotions: self.demotions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hot_bytes: u64,
    pub hot_entries: usize,
    /// Budget currently enforced on the hot tier
    pub hot_budget_bytes: u64,
    pub hot_hits: u64,
    pub cold_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub promotions: u64,
    pub demotions: u64,
    pub expirations: u64,
    /// Durable-store failures absorbed as misses
    pub store_errors: u64,
    pub hit_ratio: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        let metrics = CacheMetrics::new();
        assert_eq!(metrics.hit_ratio(), 0.0);
        metrics.record_hot_hit();
        metrics.record_cold_hit();
        metrics.record_miss();
        metrics.record_miss();
        assert!((metrics.hit_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_carries_counts() {
        let metrics = CacheMetrics::new();
        metrics.record_evictions(2);
        metrics.record_demotions(3);
        let stats = metrics.snapshot(100, 2, 1000);
        assert_eq!(stats.evictions, 2);
        assert_eq!(stats.demotions, 3);
        assert_eq!(stats.hot_budget_bytes, 1000);
    }
}
