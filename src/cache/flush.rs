//! Segmented flush pacing
//!
//! Bulk invalidation deletes matches in fixed-size segments. When the match
//! count is above the configured threshold, the pacer checks the segment's
//! elapsed time and the process memory pressure after each segment and
//! sleeps for `yield_ms` if either is over budget; otherwise it yields to the
//! scheduler so other tasks keep running.

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::FlushSettings;
use crate::pressure::MemorySampler;

/// Outcome of a bulk invalidation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Distinct keys matched across both tiers
    pub matched: usize,
    /// Keys removed from at least one tier
    pub deleted: usize,
    /// Segment iterations executed
    pub segments: usize,
    /// Budget-triggered pauses taken between segments
    pub yields: usize,
    /// Cold-tier deletes that failed and were skipped
    pub failed: usize,
}

pub(crate) struct FlushPacer<'a> {
    settings: &'a FlushSettings,
    sampler: Option<&'a dyn MemorySampler>,
    paced: bool,
    segment_started: Instant,
    yields: usize,
}

impl<'a> FlushPacer<'a> {
    pub(crate) fn new(
        settings: &'a FlushSettings,
        sampler: Option<&'a dyn MemorySampler>,
        matched: usize,
    ) -> Self {
        Self {
            settings,
            sampler,
            paced: matched > settings.threshold,
            segment_started: Instant::now(),
            yields: 0,
        }
    }

    pub(crate) fn segment_size(&self) -> usize {
        self.settings.segment_size.max(1)
    }

    pub(crate) fn begin_segment(&mut self) {
        self.segment_started = Instant::now();
    }

    /// Pause between segments if a budget was exceeded
    pub(crate) async fn end_segment(&mut self) {
        if !self.paced {
            return;
        }
        let elapsed = self.segment_started.elapsed();
        let over_time = elapsed > self.settings.time_budget();
        let pressure = self.sampler.map(|s| s.pressure()).unwrap_or(0.0);
        let over_memory = pressure > self.settings.memory_budget_ratio;

        if over_time || over_memory {
            debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                pressure, "Flush segment over budget, yielding"
            );
            self.yields += 1;
            tokio::time::sleep(self.settings.yield_pause()).await;
        } else {
            tokio::task::yield_now().await;
        }
    }

    pub(crate) fn yields(&self) -> usize {
        self.yields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pressure::FixedPressure;

    #[tokio::test(start_paused = true)]
    async fn test_pacer_yields_under_memory_pressure() {
        let settings = FlushSettings {
            threshold: 10,
            memory_budget_ratio: 0.9,
            ..Default::default()
        };
        let pressure = FixedPressure::new(0.95);
        let mut pacer = FlushPacer::new(&settings, Some(&pressure), 11);

        pacer.begin_segment();
        pacer.end_segment().await;
        assert_eq!(pacer.yields(), 1);

        pressure.set(0.1);
        pacer.begin_segment();
        pacer.end_segment().await;
        assert_eq!(pacer.yields(), 1);
    }

    #[tokio::test]
    async fn test_small_flush_is_not_paced() {
        let settings = FlushSettings {
            threshold: 10,
            ..Default::default()
        };
        let pressure = FixedPressure::new(1.0);
        let mut pacer = FlushPacer::new(&settings, Some(&pressure), 10);
        pacer.begin_segment();
        pacer.end_segment().await;
        assert_eq!(pacer.yields(), 0);
    }
}
