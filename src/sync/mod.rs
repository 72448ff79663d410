//! Checkpointed batch synchronization
//!
//! ```text
//!             ┌──────────────┐
//!  control ──▶│BatchProcessor│──▶ CheckpointStore (after every item)
//!             └──────┬───────┘
//!       page / item  │  assets
//!     ┌──────────────┼──────────────┐
//!     ▼              ▼              ▼
//! OriginFetcher  CacheStore     DedupIndex ──▶ DestinationWriter
//! ```
//!
//! The processor is a single sequential worker per job. A [`JobLockRegistry`]
//! lease keeps a second run of the same job from starting, and the
//! [`ThrottleController`] paces origin calls. Every K items an
//! [`AdaptiveCleanup`] pass reacts to memory pressure.

mod checkpoint;
mod cleanup;
mod control;
mod fixture;
mod origin;
mod processor;
mod state;
mod throttle;

pub use checkpoint::{Checkpoint, CheckpointStore, SyncStats};
pub use cleanup::{AdaptiveCleanup, CleanupAction, CleanupOutcome, PressureLevel};
pub use control::{ControlFlags, JobControl, JobLockGuard, JobLockRegistry, PauseExit};
pub use fixture::{FixtureCatalog, FixtureFault, FixtureItem, FixtureOrigin, MemoryDestination};
pub use origin::{CachedItem, DestinationWriter, ItemRecord, OriginError, OriginFetcher};
pub use processor::BatchProcessor;
pub use state::{JobReport, JobState, JobStatus, StateTransition};
pub use throttle::{ThrottleController, ThrottleVerdict};
