//! Catalog Sync - resumable, cache-backed, deduplicating catalog synchronizer
//!
//! Pulls product records and their image assets from a paginated origin and
//! writes them to a destination catalog, surviving interruption without
//! duplicating work.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BatchProcessor                           │
//! │   pages → items → checkpoint        pause / cancel / resume     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │  CacheStore  │    │  DedupIndex  │    │   Throttle   │       │
//! │  │  Hot │ Cold  │    │ local│shared │    │   Cleanup    │       │
//! │  └──────┬───────┘    └──────┬───────┘    └──────────────┘       │
//! │         └─────────┬─────────┘                                   │
//! │             DurableStore                                        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Two-tier cache with eviction, demotion and segmented flush
//! - [`clock`] - Time sources
//! - [`config`] - Job configuration
//! - [`dedup`] - Content-addressed dedup index
//! - [`error`] - Error types
//! - [`pressure`] - Memory pressure sampling
//! - [`store`] - Durable key/value store port, in-memory and journaled adapters
//! - [`sync`] - Batch processor, checkpoints, control and throttling
//! - [`telemetry`] - Prometheus metrics

pub mod cache;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod pressure;
pub mod store;
pub mod sync;
pub mod telemetry;

// Re-export commonly used types
pub use cache::{CacheStore, CacheTier, SetOptions};
pub use config::SyncConfig;
pub use dedup::{DedupIndex, Digest, DigestRecord};
pub use error::{Error, Result};
pub use store::{DurableStore, InMemoryDurableStore, JournaledStore, KeyPattern};
pub use sync::{BatchProcessor, JobControl, JobReport, JobState, JobStatus};
pub use telemetry::SyncMetrics;
