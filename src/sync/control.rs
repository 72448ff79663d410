//! Job control flags and the per-job exclusive lock
//!
//! [`JobControl`] is injected into the processor and polled at the defined
//! suspension points (before each batch, before each item, during throttle
//! delays). [`JobLockRegistry`] keeps one running job per identity through
//! timed leases.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{add_duration, Clock, SystemClock};
use crate::error::{Error, Result};

// =============================================================================
// Control flags
// =============================================================================

/// Snapshot of the control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControlFlags {
    pub paused: bool,
    pub cancelled: bool,
    pub stop_immediately: bool,
}

/// Why [`JobControl::wait_while_paused`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseExit {
    Resumed,
    Cancelled,
    /// The keep-alive callback reported the job lock as lost
    LeaseLost,
}

/// Pause/cancel flags shared between a job and its control surface
///
/// `cancel` stops the job at the next item or batch boundary and lets the
/// item in flight finish. `stop_immediately` also abandons the item in
/// flight at its next throttle delay; that item is not checkpointed.
#[derive(Debug)]
pub struct JobControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
    stop_immediately: AtomicBool,
    changed: Notify,
    /// Cancelled by both stop requests; wakes delays between items
    token: Mutex<CancellationToken>,
    /// Cancelled only by `stop_immediately`; wakes delays inside an item
    abort: Mutex<CancellationToken>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            stop_immediately: AtomicBool::new(false),
            changed: Notify::new(),
            token: Mutex::new(CancellationToken::new()),
            abort: Mutex::new(CancellationToken::new()),
        }
    }
}

impl JobControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Request a cooperative stop at the next suspension point
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.token.lock().cancel();
        self.changed.notify_waiters();
    }

    /// Cancel and abandon the item in flight
    pub fn stop_immediately(&self) {
        self.stop_immediately.store(true, Ordering::SeqCst);
        self.abort.lock().cancel();
        self.cancel();
    }

    /// Clear every flag; called when a new run starts
    pub fn reset(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.cancelled.store(false, Ordering::SeqCst);
        self.stop_immediately.store(false, Ordering::SeqCst);
        *self.token.lock() = CancellationToken::new();
        *self.abort.lock() = CancellationToken::new();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the job must stop now
    pub fn should_stop(&self) -> bool {
        self.is_cancelled() || self.stop_immediately.load(Ordering::SeqCst)
    }

    pub fn flags(&self) -> ControlFlags {
        ControlFlags {
            paused: self.is_paused(),
            cancelled: self.is_cancelled(),
            stop_immediately: self.stop_immediately.load(Ordering::SeqCst),
        }
    }

    /// Token cancelled by either stop request
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// Token cancelled only by [`JobControl::stop_immediately`]
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.lock().clone()
    }

    /// Block while paused
    ///
    /// `keep_alive` runs on every wake-up (at least once per `poll`) so the
    /// caller can extend its job lock; returning `false` ends the wait with
    /// [`PauseExit::LeaseLost`].
    pub async fn wait_while_paused<F>(&self, poll: Duration, mut keep_alive: F) -> PauseExit
    where
        F: FnMut() -> bool,
    {
        loop {
            if self.should_stop() {
                return PauseExit::Cancelled;
            }
            if !keep_alive() {
                return PauseExit::LeaseLost;
            }
            if !self.is_paused() {
                return PauseExit::Resumed;
            }
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.should_stop() || !self.is_paused() {
                continue;
            }
            let _ = tokio::time::timeout(poll, notified).await;
        }
    }
}

// =============================================================================
// Job lock
// =============================================================================

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

/// Exclusive, timed locks keyed by job identity
pub struct JobLockRegistry {
    leases: DashMap<String, Lease>,
    clock: Arc<dyn Clock>,
}

impl Default for JobLockRegistry {
    fn default() -> Self {
        Self {
            leases: DashMap::new(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl JobLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            leases: DashMap::new(),
            clock,
        })
    }

    fn try_acquire(&self, job_id: &str, lease: Duration) -> Option<Uuid> {
        let now = self.clock.now();
        let fresh = Lease {
            token: Uuid::new_v4(),
            expires_at: add_duration(now, lease),
        };
        let token = fresh.token;
        match self.leases.entry(job_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Some(token)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().expires_at > now {
                    return None;
                }
                warn!(job_id, "Taking over stale job lock");
                slot.insert(fresh);
                Some(token)
            }
        }
    }

    /// Acquire the lock for a job
    ///
    /// Waits up to `wait` for a live holder to release, then fails with
    /// [`Error::JobAlreadyRunning`]. An expired lease is taken over.
    pub async fn acquire(
        self: &Arc<Self>,
        job_id: &str,
        lease: Duration,
        wait: Duration,
    ) -> Result<JobLockGuard> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(token) = self.try_acquire(job_id, lease) {
                debug!(job_id, lease_secs = lease.as_secs(), "Job lock acquired");
                return Ok(JobLockGuard {
                    registry: Arc::clone(self),
                    job_id: job_id.to_string(),
                    token,
                    lease,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::JobAlreadyRunning {
                    job_id: job_id.to_string(),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Whether a live lease exists for the job
    pub fn is_locked(&self, job_id: &str) -> bool {
        let now = self.clock.now();
        self.leases
            .get(job_id)
            .is_some_and(|lease| lease.expires_at > now)
    }

    fn refresh(&self, job_id: &str, token: Uuid, lease: Duration) -> bool {
        let now = self.clock.now();
        match self.leases.get_mut(job_id) {
            Some(mut held) if held.token == token => {
                held.expires_at = add_duration(now, lease);
                true
            }
            _ => false,
        }
    }

    fn release(&self, job_id: &str, token: Uuid) {
        let removed = self
            .leases
            .remove_if(job_id, |_, held| held.token == token)
            .is_some();
        if removed {
            info!(job_id, "Job lock released");
        }
    }
}

/// Held job lock; released on drop
pub struct JobLockGuard {
    registry: Arc<JobLockRegistry>,
    job_id: String,
    token: Uuid,
    lease: Duration,
}

impl JobLockGuard {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Extend the lease
    ///
    /// Returns `false` if the lease was lost to a takeover.
    pub fn refresh(&self) -> bool {
        let held = self.registry.refresh(&self.job_id, self.token, self.lease);
        if !held {
            warn!(job_id = %self.job_id, "Job lock lost");
        }
        held
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.job_id, self.token);
    }
}

impl std::fmt::Debug for JobLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLockGuard")
            .field("job_id", &self.job_id)
            .field("token", &self.token)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
