//! Synchronizer Configuration
//!
//! Every tunable the engine uses is supplied here at job start. Values load
//! from YAML; any omitted section falls back to its default.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Full configuration for one synchronization job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Two-tier cache settings
    pub cache: CacheSettings,
    /// Deduplication index settings
    pub dedup: DedupSettings,
    /// Pagination settings
    pub batch: BatchSettings,
    /// Adaptive cleanup settings
    pub cleanup: CleanupSettings,
    /// Inter-call delay settings
    pub throttle: ThrottleSettings,
    /// Job lock settings
    pub lock: LockSettings,
    /// Fallback poll interval while paused (milliseconds)
    pub control_poll_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            dedup: DedupSettings::default(),
            batch: BatchSettings::default(),
            cleanup: CleanupSettings::default(),
            throttle: ThrottleSettings::default(),
            lock: LockSettings::default(),
            control_poll_ms: 100,
        }
    }
}

impl SyncConfig {
    /// Load configuration from a YAML file and validate it
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parse configuration from YAML text and validate it
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let config: SyncConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants between settings
    pub fn validate(&self) -> Result<()> {
        let hot = &self.cache.hot;
        if hot.max_bytes == 0 {
            return Err(Error::Config("cache.hot.max_bytes must be > 0".into()));
        }
        if !(hot.target_ratio > 0.0 && hot.target_ratio <= 1.0) {
            return Err(Error::Config(format!(
                "cache.hot.target_ratio must be in (0, 1], got {}",
                hot.target_ratio
            )));
        }
        if hot.max_entry_bytes > hot.max_bytes {
            return Err(Error::Config(format!(
                "cache.hot.max_entry_bytes ({}) exceeds cache.hot.max_bytes ({})",
                hot.max_entry_bytes, hot.max_bytes
            )));
        }
        if self.cache.flush.segment_size == 0 {
            return Err(Error::Config("cache.flush.segment_size must be > 0".into()));
        }
        if self.batch.page_size == 0 || self.batch.volume_tiers.iter().any(|t| t.page_size == 0) {
            return Err(Error::Config("batch page sizes must be > 0".into()));
        }
        if !(self.dedup.shared_evict_fraction > 0.0 && self.dedup.shared_evict_fraction <= 1.0) {
            return Err(Error::Config(
                "dedup.shared_evict_fraction must be in (0, 1]".into(),
            ));
        }
        let c = &self.cleanup;
        if c.every_items == 0 {
            return Err(Error::Config("cleanup.every_items must be > 0".into()));
        }
        if !(c.moderate < c.aggressive && c.aggressive < c.critical) {
            return Err(Error::Config(format!(
                "cleanup thresholds must ascend: moderate {} < aggressive {} < critical {}",
                c.moderate, c.aggressive, c.critical
            )));
        }
        if !(c.critical_budget_ratio > 0.0 && c.critical_budget_ratio <= 1.0) {
            return Err(Error::Config(
                "cleanup.critical_budget_ratio must be in (0, 1]".into(),
            ));
        }
        let t = &self.throttle;
        if t.floor_ms > t.ceiling_ms {
            return Err(Error::Config(format!(
                "throttle.floor_ms ({}) exceeds throttle.ceiling_ms ({})",
                t.floor_ms, t.ceiling_ms
            )));
        }
        if t.error_multiplier < 1.0 {
            return Err(Error::Config("throttle.error_multiplier must be >= 1".into()));
        }
        Ok(())
    }

    /// Fallback poll interval while paused
    pub fn control_poll(&self) -> Duration {
        Duration::from_millis(self.control_poll_ms.max(1))
    }
}

// =============================================================================
// Cache
// =============================================================================

/// Two-tier cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Hot tier budget and placement
    pub hot: HotTierSettings,
    /// Per key-class TTLs
    pub ttl: TtlTable,
    /// Bulk invalidation
    pub flush: FlushSettings,
    /// Idle time after which hot entries are demoted by an aged demotion
    pub demote_after_secs: u64,
    /// Timeout for every durable-store call made by the cold tier
    pub store_timeout_ms: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            hot: HotTierSettings::default(),
            ttl: TtlTable::default(),
            flush: FlushSettings::default(),
            demote_after_secs: 300,
            store_timeout_ms: 5_000,
        }
    }
}

impl CacheSettings {
    pub fn demote_after(&self) -> Duration {
        Duration::from_secs(self.demote_after_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

/// Hot tier budget and placement thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HotTierSettings {
    /// Global ceiling for hot tier bytes
    pub max_bytes: u64,
    /// Eviction stops once usage falls to this fraction of `max_bytes`
    pub target_ratio: f64,
    /// Largest entry admitted to the hot tier
    pub max_entry_bytes: u64,
    /// Key classes always placed in the cold tier
    pub bulk_key_classes: Vec<String>,
}

impl Default for HotTierSettings {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024 * 1024, // 64MB
            target_ratio: 0.8,
            max_entry_bytes: 256 * 1024, // 256KB
            bulk_key_classes: vec!["bulk".to_string(), "export".to_string()],
        }
    }
}

/// Per key-class TTL table
///
/// The key class is the text before the first `:` of a cache key, so
/// `item:42` has class `item`. A TTL of zero means "never expires".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtlTable {
    /// TTL for classes absent from `classes`
    pub default_secs: u64,
    /// Class name -> TTL seconds
    pub classes: HashMap<String, u64>,
}

impl Default for TtlTable {
    fn default() -> Self {
        let classes = [("item", 3_600), ("page", 300), ("asset", 86_400)]
            .into_iter()
            .map(|(class, secs)| (class.to_string(), secs))
            .collect();
        Self {
            default_secs: 3_600,
            classes,
        }
    }
}

impl TtlTable {
    /// TTL for a key, `None` when the class never expires
    pub fn ttl_for(&self, key: &str) -> Option<Duration> {
        let secs = self
            .classes
            .get(key_class(key))
            .copied()
            .unwrap_or(self.default_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

/// Key class of a cache key (text before the first `:`)
pub fn key_class(key: &str) -> &str {
    key.split_once(':').map(|(class, _)| class).unwrap_or(key)
}

/// Segmented flush settings for bulk invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushSettings {
    /// Match count above which the flush checks budgets and yields
    pub threshold: usize,
    /// Keys deleted per segment
    pub segment_size: usize,
    /// Wall-clock budget per segment before yielding
    pub time_budget_ms: u64,
    /// Memory pressure above which the flush yields between segments
    pub memory_budget_ratio: f64,
    /// Pause taken when a budget is exceeded
    pub yield_ms: u64,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            threshold: 1_000,
            segment_size: 500,
            time_budget_ms: 200,
            memory_budget_ratio: 0.9,
            yield_ms: 50,
        }
    }
}

impl FlushSettings {
    pub fn time_budget(&self) -> Duration {
        Duration::from_millis(self.time_budget_ms)
    }

    pub fn yield_pause(&self) -> Duration {
        Duration::from_millis(self.yield_ms)
    }
}

// =============================================================================
// Dedup
// =============================================================================

/// Deduplication index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupSettings {
    /// Capacity of the shared cross-job digest map
    pub shared_capacity: usize,
    /// Fraction of the shared map dropped (oldest first) when full
    pub shared_evict_fraction: f64,
    /// Budget for a durable digest query
    pub lookup_timeout_ms: u64,
    /// Scope asset digests to their owning item
    pub scope_by_item: bool,
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            shared_capacity: 10_000,
            shared_evict_fraction: 0.2,
            lookup_timeout_ms: 5_000,
            scope_by_item: false,
        }
    }
}

impl DedupSettings {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

// =============================================================================
// Batch
// =============================================================================

/// Page size used once `processed` reaches `after_processed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTier {
    pub after_processed: u64,
    pub page_size: usize,
}

/// Pagination settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Initial page size
    pub page_size: usize,
    /// Smaller pages for large volumes
    pub volume_tiers: Vec<VolumeTier>,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            volume_tiers: vec![
                VolumeTier {
                    after_processed: 1_000,
                    page_size: 25,
                },
                VolumeTier {
                    after_processed: 5_000,
                    page_size: 10,
                },
            ],
        }
    }
}

impl BatchSettings {
    /// Page size for the given progress; never grows as volume increases
    pub fn page_size_for(&self, processed: u64) -> usize {
        self.volume_tiers
            .iter()
            .filter(|tier| processed >= tier.after_processed)
            .map(|tier| tier.page_size)
            .fold(self.page_size, usize::min)
    }
}

// =============================================================================
// Cleanup
// =============================================================================

/// Adaptive cleanup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSettings {
    /// Sample memory pressure after every K items
    pub every_items: u64,
    /// Pressure at which the Moderate level starts
    pub moderate: f64,
    /// Pressure at which the Aggressive level starts
    pub aggressive: f64,
    /// Pressure at which the Critical level starts
    pub critical: f64,
    /// Temporary hot budget (fraction of max) while Critical
    pub critical_budget_ratio: f64,
    /// Extra inter-call delay added while Critical
    pub critical_delay_boost_ms: u64,
    /// Resident memory considered 100% pressure
    pub memory_budget_bytes: u64,
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self {
            every_items: 10,
            moderate: 0.60,
            aggressive: 0.75,
            critical: 0.90,
            critical_budget_ratio: 0.5,
            critical_delay_boost_ms: 500,
            memory_budget_bytes: 512 * 1024 * 1024, // 512MB
        }
    }
}

impl CleanupSettings {
    pub fn critical_delay_boost(&self) -> Duration {
        Duration::from_millis(self.critical_delay_boost_ms)
    }
}

// =============================================================================
// Throttle
// =============================================================================

/// Inter-call delay settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleSettings {
    /// Starting delay
    pub initial_ms: u64,
    /// Lowest delay reachable through successes
    pub floor_ms: u64,
    /// Highest delay reachable through errors
    pub ceiling_ms: u64,
    /// Decrease per success
    pub success_step_ms: u64,
    /// Multiplier applied per error
    pub error_multiplier: f64,
    /// Minimum increase per error
    pub error_step_ms: u64,
    /// Consecutive errors after which the job fails
    pub max_consecutive_errors: u32,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            initial_ms: 100,
            floor_ms: 0,
            ceiling_ms: 30_000,
            success_step_ms: 25,
            error_multiplier: 2.0,
            error_step_ms: 250,
            max_consecutive_errors: 5,
        }
    }
}

// =============================================================================
// Lock
// =============================================================================

/// Job lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    /// Lease length; a lease not refreshed within it may be taken over
    pub lease_secs: u64,
    /// How long `start` waits for a held lock before rejecting
    pub acquire_wait_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lease_secs: 300,
            acquire_wait_ms: 0,
        }
    }
}

impl LockSettings {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn acquire_wait(&self) -> Duration {
        Duration::from_millis(self.acquire_wait_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
