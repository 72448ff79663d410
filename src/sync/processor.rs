//! Batch Processor - drives one synchronization job
//!
//! Walks the origin in ascending pages, handles each item through the cache
//! and dedup index, and commits a checkpoint after every item.
//!
//! # Guarantees
//!
//! 1. The checkpoint cursor only moves forward, one handled item at a time
//! 2. An errored item is committed only once a later item succeeds (or the
//!    job stops cleanly), so a run of failures that aborts the job is
//!    retried on resume
//! 3. Cancellation is observed before each batch, before each item and
//!    during throttle delays; handled items are never rolled back
//! 4. Origin authentication failures, runs of consecutive errors and a lost
//!    job lock end the job in `Failed`; the checkpoint survives for a later
//!    resume
//! 5. Cache and dedup infrastructure failures never fail an item
//! 6. The job lock is refreshed before every item and while paused

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::checkpoint::{Checkpoint, CheckpointStore, SyncStats};
use super::cleanup::AdaptiveCleanup;
use super::control::{JobControl, JobLockGuard, JobLockRegistry, PauseExit};
use super::origin::{CachedItem, DestinationWriter, OriginFetcher};
use super::state::{JobReport, JobState, JobStatus};
use super::throttle::{ThrottleController, ThrottleVerdict};
use crate::cache::{CacheStore, SetOptions};
use crate::config::SyncConfig;
use crate::dedup::{DedupIndex, SharedDigestMap};
use crate::error::{Error, Result};
use crate::pressure::{MemorySampler, ProcessMemorySampler};
use crate::store::DurableStore;
use crate::telemetry::SyncMetrics;

/// What handling one item produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ItemOutcome {
    /// Served from the cache without origin calls
    cached: bool,
    assets_stored: u64,
    assets_reused: u64,
}

/// Progress of the current run
#[derive(Debug, Clone, Copy)]
struct RunProgress {
    /// Last committed cursor
    cursor: Option<u64>,
    /// Last id handled, committed or not; pages are fetched after it
    position: Option<u64>,
    /// Trailing errored item not yet committed
    held: Option<u64>,
    stats: SyncStats,
    /// Items handled by this run (not counting resumed progress)
    items_seen: u64,
}

/// Checkpointed, resumable synchronization job
pub struct BatchProcessor {
    job_id: String,
    config: SyncConfig,
    cache: Arc<CacheStore>,
    dedup: Arc<DedupIndex>,
    checkpoints: CheckpointStore,
    origin: Arc<dyn OriginFetcher>,
    destination: Arc<dyn DestinationWriter>,
    control: Arc<JobControl>,
    locks: Arc<JobLockRegistry>,
    sampler: Arc<dyn MemorySampler>,
    metrics: Option<SyncMetrics>,
    status: RwLock<JobStatus>,
}

impl BatchProcessor {
    /// Processor over `store` with its own cache, dedup index, control
    /// flags and lock registry
    ///
    /// Fails with [`Error::Config`] when `config` does not validate.
    pub fn new(
        job_id: &str,
        config: SyncConfig,
        store: Arc<dyn DurableStore>,
        origin: Arc<dyn OriginFetcher>,
        destination: Arc<dyn DestinationWriter>,
    ) -> Result<Self> {
        config.validate()?;
        let sampler: Arc<dyn MemorySampler> = Arc::new(ProcessMemorySampler::new(
            config.cleanup.memory_budget_bytes,
        ));
        let cache = Arc::new(
            CacheStore::new(&config.cache, Arc::clone(&store))
                .with_memory_sampler(Arc::clone(&sampler)),
        );
        let dedup = Arc::new(DedupIndex::new(
            Arc::clone(&store),
            SharedDigestMap::from_settings(&config.dedup),
            &config.dedup,
        ));
        let checkpoints = CheckpointStore::new(store, config.cache.store_timeout());

        Ok(Self {
            job_id: job_id.to_string(),
            cache,
            dedup,
            checkpoints,
            origin,
            destination,
            control: JobControl::new(),
            locks: JobLockRegistry::new(),
            sampler,
            metrics: None,
            status: RwLock::new(JobStatus::new(job_id)),
            config,
        })
    }

    /// Share a cache with other processors
    pub fn with_cache(mut self, cache: Arc<CacheStore>) -> Self {
        self.cache = cache;
        self
    }

    /// Share a dedup index (and its shared level) with other processors
    pub fn with_dedup(mut self, dedup: Arc<DedupIndex>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_control(mut self, control: Arc<JobControl>) -> Self {
        self.control = control;
        self
    }

    pub fn with_locks(mut self, locks: Arc<JobLockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    /// Memory sampler used by adaptive cleanup
    pub fn with_memory_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_metrics(mut self, metrics: SyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn dedup(&self) -> &Arc<DedupIndex> {
        &self.dedup
    }

    pub fn control(&self) -> Arc<JobControl> {
        Arc::clone(&self.control)
    }

    // =========================================================================
    // Control surface
    // =========================================================================

    /// Current state, counters and last checkpoint
    pub fn status(&self) -> JobStatus {
        self.status.read().clone()
    }

    pub fn pause(&self) {
        info!(job_id = %self.job_id, "Pause requested");
        self.control.pause();
    }

    pub fn resume(&self) {
        info!(job_id = %self.job_id, "Resume requested");
        self.control.resume();
    }

    pub fn cancel(&self) {
        info!(job_id = %self.job_id, "Cancel requested");
        self.control.cancel();
    }

    /// Cancel and abandon the item in flight instead of finishing it
    pub fn stop_immediately(&self) {
        info!(job_id = %self.job_id, "Immediate stop requested");
        self.control.stop_immediately();
    }

    // =========================================================================
    // Run
    // =========================================================================

    /// Run the job to a terminal state
    ///
    /// With `resume`, continues after the saved checkpoint if one exists;
    /// otherwise any checkpoint is discarded and counters start at zero.
    /// Returns an error only when the run could not start (the job lock is
    /// held elsewhere, or the checkpoint to resume from cannot be read);
    /// every other outcome is reported through [`JobReport::state`].
    #[instrument(skip(self), fields(job_id = %self.job_id))]
    pub async fn run(&self, resume: bool) -> Result<JobReport> {
        let lock = self
            .locks
            .acquire(
                &self.job_id,
                self.config.lock.lease(),
                self.config.lock.acquire_wait(),
            )
            .await?;

        self.control.reset();
        self.dedup.begin_run();
        let throttle = ThrottleController::new(self.config.throttle.clone());
        let cleanup = AdaptiveCleanup::new(self.config.cleanup.clone(), Arc::clone(&self.sampler));

        let checkpoint = self.resume_point(resume).await?;
        let cursor = checkpoint.as_ref().map(|c| c.last_processed_cursor);
        let mut progress = RunProgress {
            cursor,
            position: cursor,
            held: None,
            stats: checkpoint.as_ref().map(|c| c.stats).unwrap_or_default(),
            items_seen: 0,
        };
        {
            let mut status = self.status.write();
            *status = JobStatus::new(&self.job_id);
            status.stats = progress.stats;
            status.resumed_from = progress.cursor;
            status.last_checkpoint = checkpoint;
        }
        let message = match progress.cursor {
            Some(cursor) => format!("resumed after item {}", cursor),
            None => "started".to_string(),
        };
        self.transition(JobState::Running, &message)?;

        match self.drive(&mut progress, &lock, &throttle, &cleanup).await {
            Ok(JobState::Completed) => {
                if let Err(e) = self.checkpoints.clear(&self.job_id).await {
                    warn!(error = %e, "Failed to clear checkpoint of completed job");
                }
                self.status.write().last_checkpoint = None;
                self.transition(JobState::Completed, "all pages exhausted")?;
            }
            Ok(state) => {
                self.settle(&mut progress).await;
                self.transition(state, "stop requested")?;
            }
            Err(e) => {
                warn!(error = %e, cursor = ?progress.cursor, "Job failed; checkpoint kept");
                self.status.write().fail(&e)?;
            }
        }
        drop(lock);

        let report = JobReport::new(
            &self.status(),
            progress.cursor,
            self.cache.stats(),
            self.dedup.stats(),
        );
        info!(
            state = %report.state,
            processed = report.stats.processed,
            skipped_duplicate = report.stats.skipped_duplicate,
            errors = report.stats.errors,
            duration_ms = report.duration_ms,
            "Job finished"
        );
        Ok(report)
    }

    /// Page loop; returns the terminal state or the fatal error
    async fn drive(
        &self,
        progress: &mut RunProgress,
        lock: &JobLockGuard,
        throttle: &ThrottleController,
        cleanup: &AdaptiveCleanup,
    ) -> Result<JobState> {
        let token = self.control.cancellation_token();
        let abort = self.control.abort_token();

        loop {
            if let Some(stop) = self.control_point(lock).await? {
                return Ok(stop);
            }

            let limit = self.config.batch.page_size_for(progress.stats.processed);
            if !throttle.pause(&token).await {
                continue;
            }
            let ids = match self.origin.fetch_page(progress.position, limit).await {
                Ok(ids) => ids,
                Err(e) if e.is_auth() => return Err(Error::OriginAuth(e.to_string())),
                Err(e) => {
                    warn!(after = ?progress.position, error = %e, "Page fetch failed");
                    match throttle.on_error() {
                        ThrottleVerdict::Continue { delay } => {
                            debug!(delay_ms = delay.as_millis() as u64, "Retrying page");
                            continue;
                        }
                        ThrottleVerdict::Abort {
                            consecutive,
                            threshold,
                        } => {
                            return Err(Error::TooManyConsecutiveErrors {
                                count: consecutive,
                                threshold,
                            })
                        }
                    }
                }
            };
            if ids.is_empty() {
                return Ok(JobState::Completed);
            }
            debug!(after = ?progress.position, limit, fetched = ids.len(), "Fetched page");

            for item_id in ids {
                if let Some(stop) = self.control_point(lock).await? {
                    return Ok(stop);
                }
                // Pages must ascend past the last handled id
                if progress.position.is_some_and(|position| item_id <= position) {
                    debug!(item_id, position = ?progress.position, "Skipping id at or before cursor");
                    continue;
                }

                match self.process_item(item_id, throttle, &abort).await {
                    Ok(Some(outcome)) => {
                        progress.stats.processed += 1;
                        progress.stats.skipped_duplicate += outcome.assets_reused;
                        progress.stats.assets_stored += outcome.assets_stored;
                        throttle.on_success();
                        if let Some(metrics) = &self.metrics {
                            metrics.record_item(if outcome.cached { "cached" } else { "synced" });
                            metrics.record_assets("stored", outcome.assets_stored);
                            metrics.record_assets("reused", outcome.assets_reused);
                        }
                        progress.position = Some(item_id);
                        progress.cursor = Some(item_id);
                        progress.held = None;
                        self.commit(item_id, progress.stats).await;
                    }
                    // Abandoned during a throttle delay; the item is not committed
                    Ok(None) => return Ok(JobState::Cancelled),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => {
                        warn!(item_id, error = %e, "Item failed; skipping");
                        progress.stats.errors += 1;
                        progress.position = Some(item_id);
                        progress.held = Some(item_id);
                        self.status.write().stats = progress.stats;
                        if let Some(metrics) = &self.metrics {
                            metrics.record_item("error");
                        }
                        // The errored run stays uncommitted so a resume retries it
                        if let ThrottleVerdict::Abort {
                            consecutive,
                            threshold,
                        } = throttle.on_error()
                        {
                            return Err(Error::TooManyConsecutiveErrors {
                                count: consecutive,
                                threshold,
                            });
                        }
                    }
                }

                progress.items_seen += 1;
                if cleanup.is_due(progress.items_seen) {
                    let outcome = cleanup.run(&self.cache, throttle).await;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_cleanup(outcome.level.as_str());
                    }
                }
                if let Some(metrics) = &self.metrics {
                    metrics.set_hot_bytes(self.cache.hot_bytes());
                    metrics.set_delay_ms(throttle.current_delay().as_millis() as u64);
                }
            }
        }
    }

    /// Handle one item
    ///
    /// Returns `None` when an immediate stop interrupted a throttle delay.
    async fn process_item(
        &self,
        item_id: u64,
        throttle: &ThrottleController,
        abort: &CancellationToken,
    ) -> Result<Option<ItemOutcome>> {
        let key = CachedItem::cache_key(item_id);
        let hit = self.cache.get(&key).await;
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup(hit.as_ref().map(|h| h.tier));
        }
        if let Some(hit) = hit {
            match serde_json::from_slice::<CachedItem>(&hit.value) {
                Ok(cached) => {
                    debug!(item_id, item_ref = %cached.item_ref, tier = %hit.tier, "Item already synced");
                    return Ok(Some(ItemOutcome {
                        cached: true,
                        ..Default::default()
                    }));
                }
                Err(e) => {
                    warn!(item_id, error = %e, "Dropping undecodable cache entry");
                    self.cache.delete(&key).await;
                }
            }
        }

        if !throttle.pause(abort).await {
            return Ok(None);
        }
        let record = self
            .origin
            .fetch_item(item_id)
            .await
            .map_err(|e| e.into_error(item_id))?;
        if !throttle.pause(abort).await {
            return Ok(None);
        }
        let assets = self
            .origin
            .fetch_asset(item_id)
            .await
            .map_err(|e| e.into_error(item_id))?;

        let scope = self
            .config
            .dedup
            .scope_by_item
            .then(|| item_id.to_string());
        let mut outcome = ItemOutcome::default();
        let mut asset_refs = Vec::with_capacity(assets.len());

        for (order, content) in assets.iter().enumerate() {
            let order = order as i32;
            let lookup = self.dedup.lookup(content, scope.as_deref()).await;
            match lookup.record {
                Some(existing) => {
                    if scope.is_some()
                        && existing.scope_key == scope
                        && existing.order_hint != order
                    {
                        if let Err(e) = self
                            .dedup
                            .set_order_hint(&lookup.digest, scope.as_deref(), order)
                            .await
                        {
                            warn!(item_id, error = %e, "Failed to update order hint");
                        }
                    }
                    debug!(item_id, digest = %lookup.digest.short(), level = ?lookup.level, "Reusing asset");
                    asset_refs.push(existing.artifact_ref);
                    outcome.assets_reused += 1;
                }
                None => {
                    let artifact_ref = self.destination.write_asset(item_id, content).await?;
                    self.dedup
                        .record(lookup.digest, scope.as_deref(), &artifact_ref, order)
                        .await;
                    asset_refs.push(artifact_ref);
                    outcome.assets_stored += 1;
                }
            }
        }

        let item_ref = self.destination.write_item(&record, &asset_refs).await?;
        let cached = CachedItem {
            record,
            item_ref,
            asset_refs,
        };
        match serde_json::to_vec(&cached) {
            Ok(json) => {
                self.cache
                    .set(&key, Bytes::from(json), SetOptions::default())
                    .await;
            }
            Err(e) => warn!(item_id, error = %e, "Failed to encode item for cache"),
        }
        Ok(Some(outcome))
    }

    /// Observe control flags and keep the job lock alive
    ///
    /// `Some` when the job must stop; [`Error::LockLost`] when another run
    /// took the lock over.
    async fn control_point(&self, lock: &JobLockGuard) -> Result<Option<JobState>> {
        if self.control.should_stop() {
            return Ok(Some(JobState::Cancelled));
        }
        if self.control.is_paused() {
            self.transition(JobState::Paused, "pause requested")?;
            match self
                .control
                .wait_while_paused(self.config.control_poll(), || lock.refresh())
                .await
            {
                PauseExit::Resumed => self.transition(JobState::Running, "resumed")?,
                PauseExit::Cancelled => return Ok(Some(JobState::Cancelled)),
                PauseExit::LeaseLost => return Err(self.lock_lost()),
            }
        }
        if !lock.refresh() {
            return Err(self.lock_lost());
        }
        Ok(None)
    }

    fn lock_lost(&self) -> Error {
        Error::LockLost {
            job_id: self.job_id.clone(),
        }
    }

    /// Persist progress after an item
    async fn commit(&self, cursor: u64, stats: SyncStats) {
        let checkpoint = Checkpoint::new(&self.job_id, cursor, stats);
        if let Err(e) = self.checkpoints.save(&checkpoint).await {
            warn!(cursor, error = %e, "Failed to save checkpoint");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_cursor(cursor);
        }
        let mut status = self.status.write();
        status.stats = stats;
        status.last_checkpoint = Some(checkpoint);
    }

    /// Commit a trailing errored item when the job stops cleanly
    async fn settle(&self, progress: &mut RunProgress) {
        if let Some(item_id) = progress.held.take() {
            progress.cursor = Some(item_id);
            self.commit(item_id, progress.stats).await;
        }
    }

    /// Checkpoint to continue from
    ///
    /// A checkpoint that cannot be read while resuming fails the start;
    /// falling back to a fresh run would overwrite it.
    async fn resume_point(&self, resume: bool) -> Result<Option<Checkpoint>> {
        if !resume {
            if let Err(e) = self.checkpoints.clear(&self.job_id).await {
                warn!(error = %e, "Failed to clear checkpoint");
            }
            return Ok(None);
        }
        match self.checkpoints.load(&self.job_id).await {
            Ok(Some(checkpoint)) => {
                info!(
                    cursor = checkpoint.last_processed_cursor,
                    processed = checkpoint.stats.processed,
                    "Resuming from checkpoint"
                );
                Ok(Some(checkpoint))
            }
            Ok(None) => {
                info!("No checkpoint found; starting from the beginning");
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Checkpoint unreadable; not starting");
                Err(e)
            }
        }
    }

    fn transition(&self, next: JobState, message: &str) -> Result<()> {
        let mut status = self.status.write();
        let from = status.state;
        status.transition(next, message)?;
        info!(job_id = %self.job_id, from = %from, to = %next, reason = message, "Job state changed");
        Ok(())
    }
}

impl std::fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("job_id", &self.job_id)
            .field("state", &self.status.read().state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pressure::FixedPressure;
    use crate::store::InMemoryDurableStore;
    use crate::sync::fixture::{FixtureFault, FixtureItem, FixtureOrigin, MemoryDestination};
    use crate::sync::origin::ItemRecord;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::time::Duration;

    fn fast_config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.throttle.initial_ms = 0;
        config.throttle.error_step_ms = 0;
        config.batch.page_size = 4;
        config.cleanup.every_items = 3;
        config.cleanup.critical_delay_boost_ms = 0;
        config
    }

    struct Harness {
        store: Arc<InMemoryDurableStore>,
        origin: Arc<FixtureOrigin>,
        destination: Arc<MemoryDestination>,
    }

    impl Harness {
        fn new(origin: FixtureOrigin) -> Self {
            Self {
                store: Arc::new(InMemoryDurableStore::new()),
                origin: Arc::new(origin),
                destination: Arc::new(MemoryDestination::new()),
            }
        }

        fn processor(&self, job_id: &str, config: SyncConfig) -> BatchProcessor {
            BatchProcessor::new(
                job_id,
                config,
                self.store.clone(),
                self.origin.clone(),
                self.destination.clone(),
            )
            .unwrap()
            .with_memory_sampler(Arc::new(FixedPressure::new(0.0)))
        }
    }

    /// Destination that flips a control flag once a given item is written
    struct SignalAfter {
        inner: Arc<MemoryDestination>,
        control: Arc<JobControl>,
        item_id: u64,
        pause: bool,
    }

    #[async_trait]
    impl DestinationWriter for SignalAfter {
        async fn write_item(&self, record: &ItemRecord, asset_refs: &[String]) -> Result<String> {
            let item_ref = self.inner.write_item(record, asset_refs).await?;
            if record.id == self.item_id {
                if self.pause {
                    self.control.pause();
                } else {
                    self.control.cancel();
                }
            }
            Ok(item_ref)
        }

        async fn write_asset(&self, item_id: u64, content: &Bytes) -> Result<String> {
            self.inner.write_asset(item_id, content).await
        }
    }

    fn item(id: u64, assets: &[&str]) -> FixtureItem {
        FixtureItem {
            record: ItemRecord {
                id,
                sku: format!("SKU-{}", id),
                name: format!("Item {}", id),
                fields: Default::default(),
            },
            assets: assets.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn test_completes_and_clears_checkpoint() {
        let harness = Harness::new(FixtureOrigin::generated(10));
        let processor = harness.processor("catalog", fast_config());

        let report = processor.run(false).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.stats.processed, 10);
        assert_eq!(report.stats.assets_stored, 10);
        assert_eq!(report.stats.errors, 0);
        assert_eq!(report.last_cursor, Some(10));
        assert_eq!(harness.destination.item_count(), 10);

        let checkpoints = CheckpointStore::new(harness.store.clone(), Duration::from_secs(1));
        assert!(checkpoints.load("catalog").await.unwrap().is_none());
        assert!(processor.status().last_checkpoint.is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_sixth_item() {
        let harness = Harness::new(FixtureOrigin::generated(10));
        let control = JobControl::new();
        let destination = Arc::new(SignalAfter {
            inner: harness.destination.clone(),
            control: control.clone(),
            item_id: 6,
            pause: false,
        });
        let processor = BatchProcessor::new(
            "catalog",
            fast_config(),
            harness.store.clone(),
            harness.origin.clone(),
            destination,
        )
        .unwrap()
        .with_control(control)
        .with_memory_sampler(Arc::new(FixedPressure::new(0.0)));

        let report = processor.run(false).await.unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.stats.processed, 6);

        let status = processor.status();
        assert_eq!(status.last_checkpoint.unwrap().last_processed_cursor, 6);

        let checkpoints = CheckpointStore::new(harness.store.clone(), Duration::from_secs(1));
        let saved = checkpoints.load("catalog").await.unwrap().unwrap();
        assert_eq!(saved.last_processed_cursor, 6);
        assert_eq!(saved.stats.processed, 6);
    }

    #[tokio::test]
    async fn test_resume_matches_uninterrupted_run() {
        let catalog = || {
            FixtureOrigin::new(
                (1..=10)
                    .map(|id| item(id, &[&format!("img-{}", id), "shared-logo"]))
                    .collect(),
            )
        };

        // Uninterrupted reference run
        let reference = Harness::new(catalog());
        let expected = reference
            .processor("catalog", fast_config())
            .run(false)
            .await
            .unwrap();

        // Interrupted after item 6, then resumed by a fresh processor
        let harness = Harness::new(catalog());
        let control = JobControl::new();
        let first = BatchProcessor::new(
            "catalog",
            fast_config(),
            harness.store.clone(),
            harness.origin.clone(),
            Arc::new(SignalAfter {
                inner: harness.destination.clone(),
                control: control.clone(),
                item_id: 6,
                pause: false,
            }),
        )
        .unwrap()
        .with_control(control);
        assert_eq!(first.run(false).await.unwrap().state, JobState::Cancelled);
        let item_calls_before = harness.origin.call_counts().1;

        let resumed = harness.processor("catalog", fast_config());
        let report = resumed.run(true).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.resumed_from, Some(6));
        assert_eq!(report.stats, expected.stats);
        // Only items 7..=10 were fetched again
        assert_eq!(harness.origin.call_counts().1 - item_calls_before, 4);
    }

    #[tokio::test]
    async fn test_restart_without_resume_starts_over() {
        let harness = Harness::new(FixtureOrigin::generated(4));
        let checkpoints = CheckpointStore::new(harness.store.clone(), Duration::from_secs(1));
        checkpoints
            .save(&Checkpoint::new(
                "catalog",
                3,
                SyncStats {
                    processed: 3,
                    ..Default::default()
                },
            ))
            .await
            .unwrap();

        let report = harness
            .processor("catalog", fast_config())
            .run(false)
            .await
            .unwrap();
        assert_eq!(report.resumed_from, None);
        assert_eq!(report.stats.processed, 4);
    }

    #[tokio::test]
    async fn test_auth_failure_fails_job_and_keeps_checkpoint() {
        let harness = Harness::new(FixtureOrigin::generated(5));
        harness.origin.inject_fault(3, FixtureFault::Unauthorized);
        let processor = harness.processor("catalog", fast_config());

        let report = processor.run(false).await.unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.stats.processed, 2);
        assert!(report.error.unwrap().contains("authentication"));

        let checkpoints = CheckpointStore::new(harness.store.clone(), Duration::from_secs(1));
        let saved = checkpoints.load("catalog").await.unwrap().unwrap();
        assert_eq!(saved.last_processed_cursor, 2);
    }

    #[tokio::test]
    async fn test_item_error_is_counted_and_skipped() {
        let harness = Harness::new(FixtureOrigin::generated(8));
        harness.origin.inject_fault(5, FixtureFault::Malformed);
        let report = harness
            .processor("catalog", fast_config())
            .run(false)
            .await
            .unwrap();

        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.stats.processed, 7);
        assert_eq!(report.stats.errors, 1);
        assert!(harness.destination.asset_refs(5).is_none());
    }

    #[tokio::test]
    async fn test_consecutive_errors_fail_job() {
        let harness = Harness::new(FixtureOrigin::generated(8));
        for id in 2..=4 {
            harness.origin.inject_fault(id, FixtureFault::Transient);
        }
        let mut config = fast_config();
        config.throttle.max_consecutive_errors = 2;

        let report = harness
            .processor("catalog", config)
            .run(false)
            .await
            .unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.stats.errors, 3);
        // The failing run is not committed
        assert_eq!(report.last_cursor, Some(1));
        assert!(report.error.unwrap().contains("consecutive"));

        let checkpoints = CheckpointStore::new(harness.store.clone(), Duration::from_secs(1));
        let saved = checkpoints.load("catalog").await.unwrap().unwrap();
        assert_eq!(saved.last_processed_cursor, 1);
        assert_eq!(saved.stats.errors, 0);
    }

    #[tokio::test]
    async fn test_resume_retries_items_of_aborted_run() {
        let harness = Harness::new(FixtureOrigin::generated(8));
        for id in 2..=4 {
            harness.origin.inject_fault(id, FixtureFault::Transient);
        }
        let mut config = fast_config();
        config.throttle.max_consecutive_errors = 2;
        let processor = harness.processor("catalog", config);

        let first = processor.run(false).await.unwrap();
        assert_eq!(first.state, JobState::Failed);

        harness.origin.clear_faults();
        let report = processor.run(true).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.resumed_from, Some(1));
        assert_eq!(report.stats.processed, 8);
        assert_eq!(report.stats.errors, 0);
        assert_eq!(harness.destination.item_count(), 8);
    }

    #[tokio::test]
    async fn test_errored_item_committed_by_later_success() {
        let harness = Harness::new(FixtureOrigin::generated(6));
        harness.origin.inject_fault(3, FixtureFault::Transient);
        let control = JobControl::new();
        let processor = BatchProcessor::new(
            "catalog",
            fast_config(),
            harness.store.clone(),
            harness.origin.clone(),
            Arc::new(SignalAfter {
                inner: harness.destination.clone(),
                control: control.clone(),
                item_id: 4,
                pause: false,
            }),
        )
        .unwrap()
        .with_control(control);

        let report = processor.run(false).await.unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.last_cursor, Some(4));
        assert_eq!(report.stats.errors, 1);
        assert_eq!(report.stats.processed, 3);
    }

    #[tokio::test]
    async fn test_duplicate_assets_are_reused() {
        let origin = FixtureOrigin::new(vec![
            item(1, &["logo", "front-1"]),
            item(2, &["logo", "front-2"]),
            item(3, &["logo"]),
            item(4, &["logo", "front-4"]),
        ]);
        let harness = Harness::new(origin);
        let report = harness
            .processor("catalog", fast_config())
            .run(false)
            .await
            .unwrap();

        assert_eq!(report.stats.processed, 4);
        assert_eq!(report.stats.skipped_duplicate, 3);
        assert_eq!(report.stats.assets_stored, 4);
        assert_eq!(harness.destination.asset_count(), 4);

        let first = harness.destination.asset_refs(1).unwrap();
        let third = harness.destination.asset_refs(3).unwrap();
        assert_eq!(first[0], third[0]);
    }

    #[tokio::test]
    async fn test_scoped_dedup_keeps_items_apart() {
        let origin = FixtureOrigin::new(vec![item(1, &["logo"]), item(2, &["logo"])]);
        let harness = Harness::new(origin);
        let mut config = fast_config();
        config.dedup.scope_by_item = true;

        let report = harness
            .processor("catalog", config)
            .run(false)
            .await
            .unwrap();
        assert_eq!(report.stats.skipped_duplicate, 0);
        assert_eq!(report.stats.assets_stored, 2);
    }

    #[tokio::test]
    async fn test_cached_items_skip_origin() {
        let harness = Harness::new(FixtureOrigin::generated(6));
        let processor = harness.processor("catalog", fast_config());
        processor.run(false).await.unwrap();
        let (_, item_calls, _) = harness.origin.call_counts();

        let report = processor.run(false).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.stats.processed, 6);
        assert_eq!(harness.origin.call_counts().1, item_calls);
        assert_eq!(harness.destination.item_writes(), 6);
        assert!(report.cache.hot_hits >= 6);
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let harness = Harness::new(FixtureOrigin::generated(6));
        let control = JobControl::new();
        let processor = Arc::new(
            BatchProcessor::new(
                "catalog",
                fast_config(),
                harness.store.clone(),
                harness.origin.clone(),
                Arc::new(SignalAfter {
                    inner: harness.destination.clone(),
                    control: control.clone(),
                    item_id: 3,
                    pause: true,
                }),
            )
            .unwrap()
            .with_control(control),
        );

        let handle = tokio::spawn({
            let processor = processor.clone();
            async move { processor.run(false).await }
        });

        while processor.status().state != JobState::Paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(processor.status().stats.processed, 3);
        processor.resume();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.stats.processed, 6);
        let states: Vec<_> = report.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            states,
            vec![
                JobState::Running,
                JobState::Paused,
                JobState::Running,
                JobState::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_while_paused() {
        let harness = Harness::new(FixtureOrigin::generated(6));
        let control = JobControl::new();
        let processor = Arc::new(
            BatchProcessor::new(
                "catalog",
                fast_config(),
                harness.store.clone(),
                harness.origin.clone(),
                Arc::new(SignalAfter {
                    inner: harness.destination.clone(),
                    control: control.clone(),
                    item_id: 2,
                    pause: true,
                }),
            )
            .unwrap()
            .with_control(control),
        );

        let handle = tokio::spawn({
            let processor = processor.clone();
            async move { processor.run(false).await }
        });
        while processor.status().state != JobState::Paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        processor.cancel();

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.stats.processed, 2);
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_locked() {
        let harness = Harness::new(FixtureOrigin::generated(3));
        let locks = JobLockRegistry::new();
        let _held = locks
            .acquire("catalog", Duration::from_secs(60), Duration::ZERO)
            .await
            .unwrap();

        let processor = harness
            .processor("catalog", fast_config())
            .with_locks(locks.clone());
        let err = processor.run(false).await.unwrap_err();
        assert_matches!(err, Error::JobAlreadyRunning { .. });
        assert_eq!(processor.status().state, JobState::Idle);
        assert_eq!(harness.origin.call_counts().0, 0);
    }

    #[tokio::test]
    async fn test_pause_keeps_lease_alive() {
        let harness = Harness::new(FixtureOrigin::generated(4));
        let clock = Arc::new(ManualClock::new());
        let locks = JobLockRegistry::with_clock(clock.clone());
        let mut config = fast_config();
        config.lock.lease_secs = 10;
        config.control_poll_ms = 5;

        let control = JobControl::new();
        let processor = Arc::new(
            BatchProcessor::new(
                "catalog",
                config.clone(),
                harness.store.clone(),
                harness.origin.clone(),
                Arc::new(SignalAfter {
                    inner: harness.destination.clone(),
                    control: control.clone(),
                    item_id: 2,
                    pause: true,
                }),
            )
            .unwrap()
            .with_control(control)
            .with_locks(locks.clone()),
        );
        let handle = tokio::spawn({
            let processor = processor.clone();
            async move { processor.run(false).await }
        });
        while processor.status().state != JobState::Paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Paused for 30s of lease time, refreshed along the way
        for _ in 0..5 {
            clock.advance(Duration::from_secs(6));
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        let second = harness
            .processor("catalog", config)
            .with_locks(locks.clone());
        assert_matches!(second.run(true).await, Err(Error::JobAlreadyRunning { .. }));

        processor.resume();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.stats.processed, 4);
        assert_eq!(harness.destination.item_writes(), 4);
    }

    #[tokio::test]
    async fn test_lost_lease_stops_paused_job() {
        let harness = Harness::new(FixtureOrigin::generated(4));
        let clock = Arc::new(ManualClock::new());
        let locks = JobLockRegistry::with_clock(clock.clone());
        let mut config = fast_config();
        config.lock.lease_secs = 10;
        config.control_poll_ms = 60_000;

        let control = JobControl::new();
        let first = Arc::new(
            BatchProcessor::new(
                "catalog",
                config.clone(),
                harness.store.clone(),
                harness.origin.clone(),
                Arc::new(SignalAfter {
                    inner: harness.destination.clone(),
                    control: control.clone(),
                    item_id: 2,
                    pause: true,
                }),
            )
            .unwrap()
            .with_control(control)
            .with_locks(locks.clone()),
        );
        let handle = tokio::spawn({
            let first = first.clone();
            async move { first.run(false).await }
        });
        while first.status().state != JobState::Paused {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // The lease lapses and a second run takes the job over
        clock.advance(Duration::from_secs(11));
        let second = harness
            .processor("catalog", config)
            .with_locks(locks.clone());
        let report = second.run(true).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.resumed_from, Some(2));

        first.resume();
        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.state, JobState::Failed);
        assert!(report.error.unwrap().contains("lock lost"));
        // Items 3 and 4 were written once, by the second run
        assert_eq!(harness.destination.item_writes(), 4);
    }

    #[tokio::test]
    async fn test_resume_refuses_unreadable_checkpoint() {
        let harness = Harness::new(FixtureOrigin::generated(5));
        let checkpoints = CheckpointStore::new(harness.store.clone(), Duration::from_secs(1));
        checkpoints
            .save(&Checkpoint::new("catalog", 3, SyncStats::default()))
            .await
            .unwrap();

        harness.store.set_available(false);
        let processor = harness.processor("catalog", fast_config());
        let err = processor.run(true).await.unwrap_err();
        assert!(err.is_infrastructure());
        assert_eq!(processor.status().state, JobState::Idle);
        assert_eq!(harness.origin.call_counts().0, 0);

        harness.store.set_available(true);
        let saved = checkpoints.load("catalog").await.unwrap().unwrap();
        assert_eq!(saved.last_processed_cursor, 3);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let harness = Harness::new(FixtureOrigin::generated(1));
        let mut config = fast_config();
        config.cache.hot.target_ratio = 1.5;
        let result = BatchProcessor::new(
            "catalog",
            config,
            harness.store.clone(),
            harness.origin.clone(),
            harness.destination.clone(),
        );
        assert_matches!(result, Err(Error::Config(_)));

        let mut config = fast_config();
        config.batch.page_size = 0;
        let result = BatchProcessor::new(
            "catalog",
            config,
            harness.store.clone(),
            harness.origin.clone(),
            harness.destination.clone(),
        );
        assert_matches!(result, Err(Error::Config(_)));
    }

    fn slow_item_config() -> SyncConfig {
        let mut config = fast_config();
        config.throttle.initial_ms = 1_000;
        config.throttle.floor_ms = 1_000;
        config.throttle.ceiling_ms = 1_000;
        config
    }

    /// Run until the first item fetch, then apply `stop`
    async fn stop_during_first_item(stop: fn(&BatchProcessor)) -> (JobReport, Harness) {
        let harness = Harness::new(FixtureOrigin::generated(3));
        let processor = Arc::new(harness.processor("catalog", slow_item_config()));
        let handle = tokio::spawn({
            let processor = processor.clone();
            async move { processor.run(false).await }
        });
        // Item 1 has been fetched; its asset fetch waits out a throttle delay
        while harness.origin.call_counts().1 == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop(&processor);
        (handle.await.unwrap().unwrap(), harness)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_finishes_item_in_flight() {
        let (report, harness) = stop_during_first_item(BatchProcessor::cancel).await;
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.stats.processed, 1);
        assert_eq!(report.last_cursor, Some(1));
        assert_eq!(harness.destination.item_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_immediately_abandons_item_in_flight() {
        let (report, harness) = stop_during_first_item(BatchProcessor::stop_immediately).await;
        assert_eq!(report.state, JobState::Cancelled);
        assert_eq!(report.stats.processed, 0);
        assert_eq!(report.last_cursor, None);
        assert_eq!(harness.destination.item_count(), 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_run() {
        let harness = Harness::new(FixtureOrigin::generated(2));
        let locks = JobLockRegistry::new();
        let processor = harness
            .processor("catalog", fast_config())
            .with_locks(locks.clone());
        processor.run(false).await.unwrap();
        assert!(!locks.is_locked("catalog"));
    }

    #[tokio::test]
    async fn test_store_outage_fails_open() {
        let harness = Harness::new(FixtureOrigin::generated(5));
        harness.store.set_available(false);
        let report = harness
            .processor("catalog", fast_config())
            .run(false)
            .await
            .unwrap();

        assert_eq!(report.state, JobState::Completed);
        assert_eq!(report.stats.processed, 5);
        assert_eq!(report.stats.errors, 0);
    }

    #[tokio::test]
    async fn test_critical_pressure_demotes_hot_entries() {
        let harness = Harness::new(FixtureOrigin::generated(6));
        let processor = harness
            .processor("catalog", fast_config())
            .with_memory_sampler(Arc::new(FixedPressure::new(0.95)));

        let report = processor.run(false).await.unwrap();
        assert_eq!(report.state, JobState::Completed);
        assert!(report.cache.demotions >= 3);
    }

    #[tokio::test]
    async fn test_metrics_follow_run() {
        let harness = Harness::new(FixtureOrigin::generated(3));
        let metrics = SyncMetrics::new().unwrap();
        let processor = harness
            .processor("catalog", fast_config())
            .with_metrics(metrics.clone());
        processor.run(false).await.unwrap();

        let text = metrics.encode().unwrap();
        assert!(text.contains("catalog_sync_items_total{outcome=\"synced\"} 3"));
        assert!(text.contains("catalog_sync_cursor 3"));
    }
}
