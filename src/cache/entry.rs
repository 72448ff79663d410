//! Cache Entry Types

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{add_duration, elapsed_between};

/// Tier an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    /// Bounded in-process tier
    Hot,
    /// Durable-store backed tier
    Cold,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::Hot => "hot",
            CacheTier::Cold => "cold",
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cached value with its bookkeeping
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    /// `None` means the entry never expires
    pub expires_at: Option<DateTime<Utc>>,
    pub last_access_at: DateTime<Utc>,
    pub tier: CacheTier,
}

impl CacheEntry {
    /// Create an entry written at `now`
    pub fn new(
        key: impl Into<String>,
        value: Bytes,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
        tier: CacheTier,
    ) -> Self {
        let size_bytes = value.len() as u64;
        Self {
            key: key.into(),
            value,
            size_bytes,
            created_at: now,
            expires_at: ttl.map(|ttl| add_duration(now, ttl)),
            last_access_at: now,
            tier,
        }
    }

    #[inline]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Time left before expiry, `None` for entries without TTL
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.expires_at.map(|at| elapsed_between(now, at))
    }

    /// Time since the entry was last read or written
    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.last_access_at, now)
    }

    #[inline]
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_access_at = now;
    }

    /// Same entry moved to another tier
    pub fn moved_to(mut self, tier: CacheTier) -> Self {
        self.tier = tier;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_expiry() {
        let now = Utc::now();
        let entry = CacheEntry::new(
            "item:1",
            Bytes::from_static(b"abc"),
            Some(Duration::from_secs(10)),
            now,
            CacheTier::Hot,
        );
        assert_eq!(entry.size_bytes, 3);
        assert!(!entry.is_expired(now));
        assert!(entry.is_expired(now + chrono::Duration::seconds(10)));
        assert_eq!(
            entry.remaining_ttl(now + chrono::Duration::seconds(4)),
            Some(Duration::from_secs(6))
        );
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let now = Utc::now();
        let entry = CacheEntry::new("k", Bytes::new(), None, now, CacheTier::Cold);
        assert!(!entry.is_expired(now + chrono::Duration::days(3650)));
        assert_eq!(entry.remaining_ttl(now), None);
    }

    #[test]
    fn test_idle_tracks_last_access() {
        let now = Utc::now();
        let mut entry = CacheEntry::new("k", Bytes::new(), None, now, CacheTier::Hot);
        let later = now + chrono::Duration::seconds(30);
        assert_eq!(entry.idle_for(later), Duration::from_secs(30));
        entry.touch(later);
        assert_eq!(entry.idle_for(later), Duration::ZERO);
    }
}
