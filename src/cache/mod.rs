//! Two-Tier Cache
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         CacheStore                           │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │  HotTier (in-process)        │  ColdTier (DurableStore)      │
//! │  byte budget + target ratio  │  TTL carried in entry frame   │
//! │  LRU eviction on insert      │  every call time-bounded      │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │  PlacementPolicy · promotion · demotion · segmented flush    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! TTL expiry and budget eviction are independent removal paths. Either may
//! remove an entry first; removing an absent entry is a no-op.

mod cold;
mod entry;
mod flush;
mod hot;
mod manager;
mod metrics;
mod policy;

pub use cold::{ColdTier, COLD_KEY_PREFIX};
pub use entry::{CacheEntry, CacheTier};
pub use flush::FlushReport;
pub use hot::{HotInsert, HotTier};
pub use manager::{
    CacheHit, CacheStore, DemotionMode, DemotionReport, PurgeReport, SetOptions, Ttl,
};
pub use metrics::{CacheMetrics, CacheStats};
pub use policy::{PlacementPolicy, ThresholdPlacement, TierBudget};
