//! Hot Tier - bounded in-process cache
//!
//! Recency is tracked with a monotonically increasing access sequence: each
//! read or write moves the key to the back of a `BTreeMap` ordered by
//! sequence, so the front is always the least recently used entry and
//! entries never accessed since insertion leave in insertion order.
//!
//! Eviction runs after an insert pushes usage above `max_bytes` and removes
//! entries from the front until usage is at or below the target ratio.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Duration;

use super::entry::{CacheEntry, CacheTier};
use super::policy::TierBudget;
use crate::store::KeyPattern;

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    seq: u64,
}

#[derive(Debug, Default)]
struct HotInner {
    slots: HashMap<String, Slot>,
    /// seq -> key, least recently used first
    recency: BTreeMap<u64, String>,
    next_seq: u64,
    used_bytes: u64,
    /// Temporary lower budget under memory pressure
    override_budget: Option<TierBudget>,
}

impl HotInner {
    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.seq);
        self.used_bytes = self.used_bytes.saturating_sub(slot.entry.size_bytes);
        Some(slot.entry)
    }

    /// Remove least recently used entries until usage reaches `target`
    fn evict_to(&mut self, target: u64, evicted: &mut Vec<CacheEntry>) {
        while self.used_bytes > target {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            if let Some(slot) = self.slots.remove(&key) {
                self.used_bytes = self.used_bytes.saturating_sub(slot.entry.size_bytes);
                evicted.push(slot.entry);
            }
        }
    }
}

/// Result of a hot tier insert
#[derive(Debug, Default)]
pub struct HotInsert {
    /// Previous entry under the same key
    pub replaced: Option<CacheEntry>,
    /// Entries evicted to restore the budget, in eviction order
    pub evicted: Vec<CacheEntry>,
}

/// Bounded in-memory tier with LRU eviction
#[derive(Debug)]
pub struct HotTier {
    inner: Mutex<HotInner>,
    budget: TierBudget,
}

impl HotTier {
    pub fn new(budget: TierBudget) -> Self {
        Self {
            inner: Mutex::new(HotInner::default()),
            budget,
        }
    }

    /// Read an entry, refreshing its recency
    ///
    /// Expired entries are removed and returned in `Err` so the caller can
    /// account for the expiration.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Result<Option<CacheEntry>, CacheEntry> {
        let mut inner = self.inner.lock();
        let expired = match inner.slots.get(key) {
            None => return Ok(None),
            Some(slot) => slot.entry.is_expired(now),
        };
        if expired {
            return match inner.remove(key) {
                Some(entry) => Err(entry),
                None => Ok(None),
            };
        }

        let seq = inner.bump();
        let Some(slot) = inner.slots.get_mut(key) else {
            return Ok(None);
        };
        let old_seq = std::mem::replace(&mut slot.seq, seq);
        slot.entry.touch(now);
        let entry = slot.entry.clone();
        inner.recency.remove(&old_seq);
        inner.recency.insert(seq, key.to_string());
        Ok(Some(entry))
    }

    /// Insert or replace an entry, evicting if the budget is exceeded
    pub fn insert(&self, entry: CacheEntry) -> HotInsert {
        let mut inner = self.inner.lock();
        let key = entry.key.clone();
        let replaced = inner.remove(&key);

        let seq = inner.bump();
        inner.used_bytes += entry.size_bytes;
        inner.recency.insert(seq, key.clone());
        inner.slots.insert(
            key,
            Slot {
                entry: entry.moved_to(CacheTier::Hot),
                seq,
            },
        );

        let budget = inner.override_budget.unwrap_or(self.budget);
        let mut evicted = Vec::new();
        if budget.is_exceeded(inner.used_bytes) {
            inner.evict_to(budget.target_bytes(), &mut evicted);
        }
        HotInsert { replaced, evicted }
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.inner.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().slots.contains_key(key)
    }

    /// Remove every expired entry
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        expired.iter().filter_map(|key| inner.remove(key)).collect()
    }

    /// Remove entries idle for at least `min_idle`, least recent first
    pub fn take_idle(&self, min_idle: Duration, now: DateTime<Utc>) -> Vec<CacheEntry> {
        let mut inner = self.inner.lock();
        let idle: Vec<String> = inner
            .recency
            .values()
            .filter(|key| {
                inner
                    .slots
                    .get(*key)
                    .is_some_and(|slot| slot.entry.idle_for(now) >= min_idle)
            })
            .cloned()
            .collect();
        idle.iter().filter_map(|key| inner.remove(key)).collect()
    }

    /// Remove every entry, least recent first
    pub fn drain(&self) -> Vec<CacheEntry> {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner.recency.values().cloned().collect();
        keys.iter().filter_map(|key| inner.remove(key)).collect()
    }

    /// Keys matching a pattern
    pub fn keys_matching(&self, pattern: &KeyPattern) -> Vec<String> {
        self.inner
            .lock()
            .slots
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect()
    }

    /// Install or clear a temporary budget
    ///
    /// Installing a budget the tier currently exceeds evicts down to its
    /// target straight away.
    pub fn set_budget_override(&self, budget: Option<TierBudget>) -> Vec<CacheEntry> {
        let mut inner = self.inner.lock();
        inner.override_budget = budget;
        let mut evicted = Vec::new();
        if let Some(budget) = budget {
            if budget.is_exceeded(inner.used_bytes) {
                inner.evict_to(budget.target_bytes(), &mut evicted);
            }
        }
        evicted
    }

    /// Budget currently enforced
    pub fn budget(&self) -> TierBudget {
        self.inner.lock().override_budget.unwrap_or(self.budget)
    }

    /// Configured budget, ignoring any override
    pub fn base_budget(&self) -> TierBudget {
        self.budget
    }

    pub fn used_bytes(&self) -> u64 {
        self.inner.lock().used_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().slots.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
