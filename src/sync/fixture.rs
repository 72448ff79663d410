//! In-memory origin and destination adapters
//!
//! [`FixtureOrigin`] serves a catalog loaded from a JSON file and supports
//! fault injection per item. [`MemoryDestination`] records every write.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::origin::{DestinationWriter, ItemRecord, OriginError, OriginFetcher};
use crate::error::{Error, Result};

/// One catalog item of a fixture file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureItem {
    #[serde(flatten)]
    pub record: ItemRecord,
    /// Asset payloads (UTF-8 text stands in for image bytes)
    #[serde(default)]
    pub assets: Vec<String>,
}

/// Fixture file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixtureCatalog {
    pub items: Vec<FixtureItem>,
}

/// Injected failure for an item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureFault {
    /// Every fetch of the item fails transiently
    Transient,
    /// The item's record is malformed
    Malformed,
    /// The origin rejects credentials when this item is fetched
    Unauthorized,
}

/// Origin backed by an in-memory catalog
#[derive(Debug, Default)]
pub struct FixtureOrigin {
    items: BTreeMap<u64, FixtureItem>,
    faults: RwLock<HashMap<u64, FixtureFault>>,
    page_calls: AtomicU64,
    item_calls: AtomicU64,
    asset_calls: AtomicU64,
}

impl FixtureOrigin {
    pub fn new(items: Vec<FixtureItem>) -> Self {
        Self {
            items: items.into_iter().map(|i| (i.record.id, i)).collect(),
            ..Default::default()
        }
    }

    pub fn from_catalog(catalog: FixtureCatalog) -> Self {
        Self::new(catalog.items)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        let catalog: FixtureCatalog = serde_json::from_slice(&raw)?;
        Ok(Self::from_catalog(catalog))
    }

    /// Simple generated catalog: items `1..=count`, one asset each
    pub fn generated(count: u64) -> Self {
        Self::new(
            (1..=count)
                .map(|id| FixtureItem {
                    record: ItemRecord {
                        id,
                        sku: format!("SKU-{:05}", id),
                        name: format!("Item {}", id),
                        fields: Default::default(),
                    },
                    assets: vec![format!("image-{}", id)],
                })
                .collect(),
        )
    }

    pub fn inject_fault(&self, item_id: u64, fault: FixtureFault) {
        self.faults.write().insert(item_id, fault);
    }

    pub fn clear_faults(&self) {
        self.faults.write().clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// (page, item, asset) fetch counts
    pub fn call_counts(&self) -> (u64, u64, u64) {
        (
            self.page_calls.load(Ordering::Relaxed),
            self.item_calls.load(Ordering::Relaxed),
            self.asset_calls.load(Ordering::Relaxed),
        )
    }

    fn check_fault(&self, item_id: u64) -> std::result::Result<(), OriginError> {
        match self.faults.read().get(&item_id) {
            None => Ok(()),
            Some(FixtureFault::Transient) => {
                Err(OriginError::Transient(format!("injected failure for {}", item_id)))
            }
            Some(FixtureFault::Malformed) => {
                Err(OriginError::Malformed(format!("item {} payload", item_id)))
            }
            Some(FixtureFault::Unauthorized) => {
                Err(OriginError::Unauthorized("token rejected".to_string()))
            }
        }
    }
}

#[async_trait]
impl OriginFetcher for FixtureOrigin {
    async fn fetch_page(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> std::result::Result<Vec<u64>, OriginError> {
        self.page_calls.fetch_add(1, Ordering::Relaxed);
        let ids = match after {
            Some(after) => self
                .items
                .range(after.saturating_add(1)..)
                .map(|(id, _)| *id)
                .take(limit)
                .collect(),
            None => self.items.keys().copied().take(limit).collect(),
        };
        Ok(ids)
    }

    async fn fetch_item(&self, item_id: u64) -> std::result::Result<ItemRecord, OriginError> {
        self.item_calls.fetch_add(1, Ordering::Relaxed);
        self.check_fault(item_id)?;
        self.items
            .get(&item_id)
            .map(|item| item.record.clone())
            .ok_or(OriginError::NotFound(item_id))
    }

    async fn fetch_asset(&self, item_id: u64) -> std::result::Result<Vec<Bytes>, OriginError> {
        self.asset_calls.fetch_add(1, Ordering::Relaxed);
        self.check_fault(item_id)?;
        let item = self
            .items
            .get(&item_id)
            .ok_or(OriginError::NotFound(item_id))?;
        Ok(item
            .assets
            .iter()
            .map(|asset| Bytes::from(asset.clone().into_bytes()))
            .collect())
    }
}

/// Destination keeping every write in memory
#[derive(Debug, Default)]
pub struct MemoryDestination {
    items: DashMap<u64, (String, Vec<String>)>,
    assets: DashMap<String, Bytes>,
    failing_items: RwLock<HashSet<u64>>,
    item_writes: AtomicU64,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make writes for an item fail
    pub fn fail_writes_for(&self, item_id: u64) {
        self.failing_items.write().insert(item_id);
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn asset_count(&self) -> usize {
        self.assets.len()
    }

    pub fn item_writes(&self) -> u64 {
        self.item_writes.load(Ordering::Relaxed)
    }

    /// Asset references written for an item
    pub fn asset_refs(&self, item_id: u64) -> Option<Vec<String>> {
        self.items.get(&item_id).map(|entry| entry.1.clone())
    }
}

#[async_trait]
impl DestinationWriter for MemoryDestination {
    async fn write_item(&self, record: &ItemRecord, asset_refs: &[String]) -> Result<String> {
        if self.failing_items.read().contains(&record.id) {
            return Err(Error::Destination(format!("write rejected for {}", record.id)));
        }
        self.item_writes.fetch_add(1, Ordering::Relaxed);
        let item_ref = format!("item-{}", record.id);
        self.items
            .insert(record.id, (item_ref.clone(), asset_refs.to_vec()));
        Ok(item_ref)
    }

    async fn write_asset(&self, item_id: u64, content: &Bytes) -> Result<String> {
        if self.failing_items.read().contains(&item_id) {
            return Err(Error::Destination(format!("asset rejected for {}", item_id)));
        }
        let artifact_ref = format!("asset-{}", Uuid::new_v4());
        self.assets.insert(artifact_ref.clone(), content.clone());
        Ok(artifact_ref)
    }
}
