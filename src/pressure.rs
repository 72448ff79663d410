//! Memory pressure sampling
//!
//! Pressure is a ratio of resident memory to a configured budget, clamped
//! to `[0.0, 1.0]`. The segmented flush and adaptive cleanup both consult a
//! [`MemorySampler`].

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

/// Source of the current memory pressure ratio
pub trait MemorySampler: Send + Sync {
    /// Pressure in `[0.0, 1.0]`
    fn pressure(&self) -> f64;
}

/// Resident set size of this process against a byte budget
///
/// Reads `/proc/self/statm`; where that is unavailable the pressure reads
/// as zero.
#[derive(Debug, Clone)]
pub struct ProcessMemorySampler {
    budget_bytes: u64,
}

const PAGE_SIZE: u64 = 4096;

impl ProcessMemorySampler {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            budget_bytes: budget_bytes.max(1),
        }
    }

    /// Resident bytes, if the platform exposes them
    pub fn resident_bytes() -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        parse_statm_resident(&statm).map(|pages| pages * PAGE_SIZE)
    }
}

fn parse_statm_resident(statm: &str) -> Option<u64> {
    statm.split_whitespace().nth(1)?.parse().ok()
}

impl MemorySampler for ProcessMemorySampler {
    fn pressure(&self) -> f64 {
        match Self::resident_bytes() {
            Some(rss) => (rss as f64 / self.budget_bytes as f64).clamp(0.0, 1.0),
            None => {
                debug!("Resident memory unavailable, reporting zero pressure");
                0.0
            }
        }
    }
}

/// Manually set pressure, for tests and dry runs
#[derive(Debug, Default)]
pub struct FixedPressure {
    /// f64 bits
    value: AtomicU64,
}

impl FixedPressure {
    pub fn new(pressure: f64) -> Self {
        let fixed = Self::default();
        fixed.set(pressure);
        fixed
    }

    pub fn set(&self, pressure: f64) {
        self.value
            .store(pressure.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl MemorySampler for FixedPressure {
    fn pressure(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}
