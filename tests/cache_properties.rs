//! Property tests for the two-tier cache and the dedup index
//!
//! Run with: `cargo test --test cache_properties`

use std::sync::Arc;

use bytes::Bytes;
use proptest::prelude::*;

use catalog_sync::cache::{CacheStore, CacheTier, SetOptions};
use catalog_sync::config::{CacheSettings, DedupSettings};
use catalog_sync::dedup::{DedupIndex, Digest, SharedDigestMap};
use catalog_sync::store::{InMemoryDurableStore, KeyPattern};

const HOT_MAX: u64 = 1_000;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn small_cache(segment_size: usize) -> CacheStore {
    let mut settings = CacheSettings::default();
    settings.hot.max_bytes = HOT_MAX;
    settings.hot.target_ratio = 0.8;
    settings.hot.max_entry_bytes = 400;
    settings.flush.segment_size = segment_size;
    settings.flush.threshold = 0;
    settings.flush.yield_ms = 0;
    CacheStore::new(&settings, Arc::new(InMemoryDurableStore::new()))
}

/// (key index, value size) pairs
fn set_sequence() -> impl Strategy<Value = Vec<(u8, usize)>> {
    prop::collection::vec((0u8..24, 1usize..900), 1..80)
}

// =============================================================================
// Cache Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The hot tier never ends a `set` above its budget
    #[test]
    fn prop_hot_bytes_within_budget(sets in set_sequence()) {
        runtime().block_on(async {
            let cache = small_cache(500);
            for (key, size) in sets {
                cache
                    .set(&format!("item:{}", key), Bytes::from(vec![0u8; size]), SetOptions::default())
                    .await;
                prop_assert!(cache.hot_bytes() <= HOT_MAX, "hot bytes {}", cache.hot_bytes());
            }
            Ok(())
        })?;
    }

    /// No key is ever held by both tiers
    #[test]
    fn prop_tiers_are_exclusive(sets in set_sequence(), reads in prop::collection::vec(0u8..24, 0..40)) {
        runtime().block_on(async {
            let cache = small_cache(500);
            for (key, size) in sets {
                cache
                    .set(&format!("item:{}", key), Bytes::from(vec![1u8; size]), SetOptions::default())
                    .await;
            }
            // Reads promote admitted cold entries
            for key in reads {
                cache.get(&format!("item:{}", key)).await;
            }
            for key in 0u8..24 {
                let tiers = cache.tiers_holding(&format!("item:{}", key)).await;
                prop_assert!(tiers.len() <= 1, "item:{} held by {:?}", key, tiers);
            }
            Ok(())
        })?;
    }

    /// A pattern flush takes ceil(K/S) segments and leaves nothing behind
    #[test]
    fn prop_segmented_flush_terminates(count in 0usize..120, segment in 1usize..16) {
        runtime().block_on(async {
            let cache = small_cache(segment);
            for i in 0..count {
                // Alternate small (hot) and large (cold) values
                let size = if i % 2 == 0 { 8 } else { 600 };
                cache
                    .set(&format!("page:{}", i), Bytes::from(vec![2u8; size]), SetOptions::default())
                    .await;
            }
            cache
                .set("item:keep", Bytes::from_static(b"keep"), SetOptions::default())
                .await;

            let report = cache
                .delete_by_pattern(&KeyPattern::new("page:*").unwrap())
                .await;
            prop_assert_eq!(report.matched, count);
            prop_assert_eq!(report.segments, count.div_ceil(segment));

            let left = cache.delete_by_pattern(&KeyPattern::new("page:*").unwrap()).await;
            prop_assert_eq!(left.matched, 0);
            prop_assert!(cache.get("item:keep").await.is_some());
            Ok(())
        })?;
    }
}

// =============================================================================
// Dedup Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Unrecorded content is never found; recorded content is found by
    /// content and by re-derived digest
    #[test]
    fn prop_dedup_lookup_idempotent(content in prop::collection::vec(any::<u8>(), 0..256)) {
        runtime().block_on(async {
            let settings = DedupSettings::default();
            let index = DedupIndex::new(
                Arc::new(InMemoryDurableStore::new()),
                SharedDigestMap::from_settings(&settings),
                &settings,
            );

            let first = index.lookup(&content, None).await;
            let second = index.lookup(&content, None).await;
            prop_assert!(!first.is_hit());
            prop_assert!(!second.is_hit());

            index.record(first.digest, None, "asset-1", 0).await;
            let by_content = index.lookup(&content, None).await;
            prop_assert_eq!(by_content.artifact_ref(), Some("asset-1"));

            let rederived = Digest::parse(&Digest::of(&content).to_hex()).unwrap();
            let by_digest = index.lookup_digest(&rederived, None).await;
            prop_assert_eq!(by_digest.map(|r| r.artifact_ref), Some("asset-1".to_string()));
            Ok(())
        })?;
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_five_entries_evict_oldest_two() {
    let cache = small_cache(500);
    for key in ["a", "b", "c", "d", "e"] {
        let tier = cache
            .set(
                &format!("item:{}", key),
                Bytes::from(vec![0u8; 300]),
                SetOptions::default(),
            )
            .await;
        assert_eq!(tier, Some(CacheTier::Hot));
    }

    assert_eq!(cache.hot_bytes(), 900);
    for key in ["a", "b"] {
        assert!(cache.tiers_holding(&format!("item:{}", key)).await.is_empty());
    }
    for key in ["c", "d", "e"] {
        assert_eq!(
            cache.tiers_holding(&format!("item:{}", key)).await,
            vec![CacheTier::Hot]
        );
    }
    assert_eq!(cache.stats().evictions, 2);
}

#[tokio::test]
async fn test_scoped_record_not_visible_to_other_scope() {
    let settings = DedupSettings::default();
    let index = DedupIndex::new(
        Arc::new(InMemoryDurableStore::new()),
        SharedDigestMap::from_settings(&settings),
        &settings,
    );
    let content = b"product-image-x";
    let digest = Digest::of(content);
    index.record(digest, Some("42"), "ref1", 0).await;

    assert_eq!(
        index.lookup(content, Some("42")).await.artifact_ref(),
        Some("ref1")
    );
    assert!(!index.lookup(content, Some("99")).await.is_hit());
}
