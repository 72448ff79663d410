//! Adaptive inter-call delay
//!
//! Successes walk the delay down by a fixed step toward the floor; errors
//! push it up multiplicatively (by at least a fixed step) toward the
//! ceiling. The delay is applied before each origin call.

use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ThrottleSettings;

/// What the processor should do after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleVerdict {
    /// Keep going with the increased delay
    Continue { delay: Duration },
    /// Consecutive errors exceeded the threshold
    Abort { consecutive: u32, threshold: u32 },
}

#[derive(Debug)]
struct ThrottleState {
    delay_ms: u64,
    boost_ms: u64,
    consecutive_errors: u32,
}

/// Rolling delay tracker
#[derive(Debug)]
pub struct ThrottleController {
    settings: ThrottleSettings,
    state: Mutex<ThrottleState>,
}

impl ThrottleController {
    pub fn new(settings: ThrottleSettings) -> Self {
        let initial = settings
            .initial_ms
            .clamp(settings.floor_ms, settings.ceiling_ms.max(settings.floor_ms));
        Self {
            settings,
            state: Mutex::new(ThrottleState {
                delay_ms: initial,
                boost_ms: 0,
                consecutive_errors: 0,
            }),
        }
    }

    /// Record a successful item
    pub fn on_success(&self) -> Duration {
        let mut state = self.state.lock();
        state.consecutive_errors = 0;
        state.delay_ms = state
            .delay_ms
            .saturating_sub(self.settings.success_step_ms)
            .max(self.settings.floor_ms);
        Duration::from_millis(state.delay_ms)
    }

    /// Record a failed item
    pub fn on_error(&self) -> ThrottleVerdict {
        let mut state = self.state.lock();
        state.consecutive_errors += 1;

        let scaled = (state.delay_ms as f64 * self.settings.error_multiplier) as u64;
        let stepped = state.delay_ms.saturating_add(self.settings.error_step_ms);
        state.delay_ms = scaled.max(stepped).min(self.settings.ceiling_ms);

        let threshold = self.settings.max_consecutive_errors;
        if state.consecutive_errors > threshold {
            return ThrottleVerdict::Abort {
                consecutive: state.consecutive_errors,
                threshold,
            };
        }
        ThrottleVerdict::Continue {
            delay: Duration::from_millis(state.delay_ms),
        }
    }

    /// Add a fixed extra delay (memory pressure); zero removes it
    pub fn set_boost(&self, extra: Duration) {
        let mut state = self.state.lock();
        let boost_ms = extra.as_millis() as u64;
        if state.boost_ms != boost_ms {
            debug!(boost_ms, "Throttle boost changed");
        }
        state.boost_ms = boost_ms;
    }

    /// Delay applied before the next origin call
    pub fn current_delay(&self) -> Duration {
        let state = self.state.lock();
        Duration::from_millis(state.delay_ms.saturating_add(state.boost_ms))
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.lock().consecutive_errors
    }

    /// Sleep for the current delay
    ///
    /// Returns `false` if `cancel` fired first.
    pub async fn pause(&self, cancel: &CancellationToken) -> bool {
        let delay = self.current_delay();
        if delay.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
