//! Adaptive cleanup under memory pressure
//!
//! Every K items the processor samples memory pressure, classifies it into a
//! [`PressureLevel`] and runs that level's row of the action table:
//!
//! | Level      | Actions                                               |
//! |------------|-------------------------------------------------------|
//! | Light      | restore hot budget, clear delay boost                 |
//! | Moderate   | restore hot budget, clear delay boost, purge expired  |
//! | Aggressive | purge expired, demote idle hot entries                |
//! | Critical   | purge expired, demote all, tighten budget, boost delay|

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::throttle::ThrottleController;
use crate::cache::{CacheStore, DemotionMode};
use crate::config::CleanupSettings;
use crate::pressure::MemorySampler;

/// Memory pressure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PressureLevel {
    Light,
    Moderate,
    Aggressive,
    Critical,
}

impl PressureLevel {
    /// Classify a pressure ratio against the configured thresholds
    pub fn from_pressure(pressure: f64, settings: &CleanupSettings) -> Self {
        match pressure {
            p if p >= settings.critical => Self::Critical,
            p if p >= settings.aggressive => Self::Aggressive,
            p if p >= settings.moderate => Self::Moderate,
            _ => Self::Light,
        }
    }

    /// Actions run at this level, in order
    pub fn actions(&self) -> &'static [CleanupAction] {
        use CleanupAction::*;
        match self {
            Self::Light => &[RelaxBudget, ClearDelayBoost],
            Self::Moderate => &[RelaxBudget, ClearDelayBoost, PurgeExpired],
            Self::Aggressive => &[PurgeExpired, DemoteAged],
            Self::Critical => &[PurgeExpired, DemoteAll, TightenBudget, BoostDelay],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Moderate => "moderate",
            Self::Aggressive => "aggressive",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cleanup step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    /// Drop expired hot entries
    PurgeExpired,
    /// Move idle hot entries to the cold tier
    DemoteAged,
    /// Move every hot entry to the cold tier
    DemoteAll,
    /// Enforce the temporary critical hot budget
    TightenBudget,
    /// Remove the temporary hot budget
    RelaxBudget,
    /// Add the critical extra delay
    BoostDelay,
    /// Remove the extra delay
    ClearDelayBoost,
}

/// What a cleanup pass did
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CleanupOutcome {
    pub level: PressureLevel,
    pub pressure: f64,
    pub purged: usize,
    pub demoted: usize,
    pub evicted: usize,
}

/// Samples pressure and runs the matching actions
pub struct AdaptiveCleanup {
    settings: CleanupSettings,
    sampler: Arc<dyn MemorySampler>,
}

impl AdaptiveCleanup {
    pub fn new(settings: CleanupSettings, sampler: Arc<dyn MemorySampler>) -> Self {
        Self { settings, sampler }
    }

    /// Whether a pass is due after `items_seen` items this run
    pub fn is_due(&self, items_seen: u64) -> bool {
        items_seen > 0 && items_seen % self.settings.every_items.max(1) == 0
    }

    pub fn sample(&self) -> (f64, PressureLevel) {
        let pressure = self.sampler.pressure();
        (pressure, PressureLevel::from_pressure(pressure, &self.settings))
    }

    /// Sample pressure and run the level's actions
    pub async fn run(&self, cache: &CacheStore, throttle: &ThrottleController) -> CleanupOutcome {
        let (pressure, level) = self.sample();
        let mut outcome = CleanupOutcome {
            level,
            pressure,
            purged: 0,
            demoted: 0,
            evicted: 0,
        };

        for action in level.actions() {
            match action {
                CleanupAction::PurgeExpired => outcome.purged += cache.purge_expired().entries,
                CleanupAction::DemoteAged => outcome.demoted += cache.demote_aged().await.moved,
                CleanupAction::DemoteAll => {
                    outcome.demoted += cache.demote(DemotionMode::All).await.moved
                }
                CleanupAction::TightenBudget => {
                    outcome.evicted += cache.tighten_hot_budget(self.settings.critical_budget_ratio)
                }
                CleanupAction::RelaxBudget => cache.relax_hot_budget(),
                CleanupAction::BoostDelay => {
                    throttle.set_boost(self.settings.critical_delay_boost())
                }
                CleanupAction::ClearDelayBoost => throttle.set_boost(std::time::Duration::ZERO),
            }
        }

        if level >= PressureLevel::Aggressive {
            info!(
                level = %level,
                pressure,
                purged = outcome.purged,
                demoted = outcome.demoted,
                evicted = outcome.evicted,
                "Memory pressure cleanup"
            );
        } else {
            debug!(level = %level, pressure, purged = outcome.purged, "Cleanup pass");
        }
        outcome
    }
}
