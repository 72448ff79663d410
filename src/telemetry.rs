//! Prometheus metrics for synchronization jobs
//!
//! Metrics live on a dedicated [`Registry`] owned by [`SyncMetrics`] so that
//! several processors (and tests) can coexist in one process.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::cache::CacheTier;
use crate::error::{Error, Result};

/// Job counters and gauges
#[derive(Clone)]
pub struct SyncMetrics {
    registry: Registry,
    items: IntCounterVec,
    assets: IntCounterVec,
    cache_lookups: IntCounterVec,
    cleanup_runs: IntCounterVec,
    hot_bytes: IntGauge,
    delay_ms: IntGauge,
    cursor: IntGauge,
}

impl SyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let items = IntCounterVec::new(
            Opts::new("catalog_sync_items_total", "Items handled by outcome"),
            &["outcome"],
        )?;
        let assets = IntCounterVec::new(
            Opts::new("catalog_sync_assets_total", "Assets handled by outcome"),
            &["outcome"],
        )?;
        let cache_lookups = IntCounterVec::new(
            Opts::new(
                "catalog_sync_cache_lookups_total",
                "Item metadata lookups by answering tier",
            ),
            &["tier"],
        )?;
        let cleanup_runs = IntCounterVec::new(
            Opts::new(
                "catalog_sync_cleanup_runs_total",
                "Adaptive cleanup passes by pressure level",
            ),
            &["level"],
        )?;
        let hot_bytes = IntGauge::new("catalog_sync_hot_tier_bytes", "Bytes held by the hot tier")?;
        let delay_ms = IntGauge::new(
            "catalog_sync_throttle_delay_ms",
            "Current inter-call delay in milliseconds",
        )?;
        let cursor = IntGauge::new("catalog_sync_cursor", "Last checkpointed item id")?;

        registry.register(Box::new(items.clone()))?;
        registry.register(Box::new(assets.clone()))?;
        registry.register(Box::new(cache_lookups.clone()))?;
        registry.register(Box::new(cleanup_runs.clone()))?;
        registry.register(Box::new(hot_bytes.clone()))?;
        registry.register(Box::new(delay_ms.clone()))?;
        registry.register(Box::new(cursor.clone()))?;

        Ok(Self {
            registry,
            items,
            assets,
            cache_lookups,
            cleanup_runs,
            hot_bytes,
            delay_ms,
            cursor,
        })
    }

    /// `outcome`: `synced`, `cached` or `error`
    pub fn record_item(&self, outcome: &str) {
        self.items.with_label_values(&[outcome]).inc();
    }

    /// `outcome`: `stored` or `reused`
    pub fn record_assets(&self, outcome: &str, count: u64) {
        if count > 0 {
            self.assets.with_label_values(&[outcome]).inc_by(count);
        }
    }

    pub fn record_cache_lookup(&self, tier: Option<CacheTier>) {
        let label = tier.map(|t| t.as_str()).unwrap_or("miss");
        self.cache_lookups.with_label_values(&[label]).inc();
    }

    pub fn record_cleanup(&self, level: &str) {
        self.cleanup_runs.with_label_values(&[level]).inc();
    }

    pub fn set_hot_bytes(&self, bytes: u64) {
        self.hot_bytes.set(bytes as i64);
    }

    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.set(delay_ms as i64);
    }

    pub fn set_cursor(&self, cursor: u64) {
        self.cursor.set(cursor as i64);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every metric
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("metrics encoding: {}", e)))
    }
}

impl std::fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_series() {
        let metrics = SyncMetrics::new().unwrap();
        metrics.record_item("synced");
        metrics.record_item("synced");
        metrics.record_assets("reused", 3);
        metrics.record_cache_lookup(Some(CacheTier::Hot));
        metrics.record_cache_lookup(None);
        metrics.set_hot_bytes(4096);

        let text = metrics.encode().unwrap();
        assert!(text.contains("catalog_sync_items_total{outcome=\"synced\"} 2"));
        assert!(text.contains("catalog_sync_assets_total{outcome=\"reused\"} 3"));
        assert!(text.contains("catalog_sync_cache_lookups_total{tier=\"miss\"} 1"));
        assert!(text.contains("catalog_sync_hot_tier_bytes 4096"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = SyncMetrics::new().unwrap();
        let b = SyncMetrics::new().unwrap();
        a.record_item("error");
        assert!(!b.encode().unwrap().contains("outcome=\"error\""));
    }
}
