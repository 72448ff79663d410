//! Cache Placement and Budget Policies
//!
//! Placement decides which tier a write lands in; the budget bounds the hot
//! tier and sets where eviction stops.

use crate::config::{key_class, HotTierSettings};

/// Decides whether a write belongs in the hot tier
pub trait PlacementPolicy: Send + Sync {
    fn should_use_hot_cache(&self, key: &str, size_hint: u64) -> bool;
}

/// Size and key-class threshold placement
///
/// Entries no larger than `max_entry_bytes` whose key class is not flagged
/// as bulk go to the hot tier; everything else goes cold.
#[derive(Debug, Clone)]
pub struct ThresholdPlacement {
    pub max_entry_bytes: u64,
    pub bulk_key_classes: Vec<String>,
}

impl ThresholdPlacement {
    pub fn from_settings(settings: &HotTierSettings) -> Self {
        Self {
            max_entry_bytes: settings.max_entry_bytes,
            bulk_key_classes: settings.bulk_key_classes.clone(),
        }
    }

    fn is_bulk(&self, key: &str) -> bool {
        let class = key_class(key);
        self.bulk_key_classes.iter().any(|bulk| bulk == class)
    }
}

impl PlacementPolicy for ThresholdPlacement {
    fn should_use_hot_cache(&self, key: &str, size_hint: u64) -> bool {
        size_hint <= self.max_entry_bytes && !self.is_bulk(key)
    }
}

/// Hot tier size budget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierBudget {
    /// Ceiling for hot tier bytes
    pub max_bytes: u64,
    /// Fraction of `max_bytes` eviction drains down to
    pub target_ratio: f64,
}

impl TierBudget {
    pub fn new(max_bytes: u64, target_ratio: f64) -> Self {
        Self {
            max_bytes,
            target_ratio: target_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_settings(settings: &HotTierSettings) -> Self {
        Self::new(settings.max_bytes, settings.target_ratio)
    }

    /// Usage eviction drains down to
    pub fn target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.target_ratio).floor() as u64
    }

    #[inline]
    pub fn is_exceeded(&self, used: u64) -> bool {
        used > self.max_bytes
    }

    /// A smaller budget with the same target ratio
    pub fn scaled(&self, ratio: f64) -> Self {
        let ratio = ratio.clamp(0.0, 1.0);
        Self::new((self.max_bytes as f64 * ratio).floor() as u64, self.target_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_by_size_and_class() {
        let policy = ThresholdPlacement {
            max_entry_bytes: 100,
            bulk_key_classes: vec!["export".to_string()],
        };
        assert!(policy.should_use_hot_cache("item:1", 100));
        assert!(!policy.should_use_hot_cache("item:1", 101));
        assert!(!policy.should_use_hot_cache("export:all", 10));
    }

    #[test]
    fn test_budget_target() {
        let budget = TierBudget::new(1000, 0.8);
        assert_eq!(budget.target_bytes(), 800);
        assert!(!budget.is_exceeded(1000));
        assert!(budget.is_exceeded(1001));

        let tight = budget.scaled(0.5);
        assert_eq!(tight.max_bytes, 500);
        assert_eq!(tight.target_bytes(), 400);
    }
}
