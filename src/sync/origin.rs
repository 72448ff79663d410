//! Origin and destination ports
//!
//! The processor pulls ids, records and assets through an [`OriginFetcher`]
//! and writes through a [`DestinationWriter`]. Transport, authentication and
//! catalog mapping live behind these traits.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};

/// A catalog record as delivered by the origin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
    pub id: u64,
    pub sku: String,
    pub name: String,
    /// Remaining origin fields, passed through untouched
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// What the cache keeps for an already synchronized item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedItem {
    pub record: ItemRecord,
    /// Destination reference of the written item
    pub item_ref: String,
    /// Destination references of its assets, in order
    pub asset_refs: Vec<String>,
}

impl CachedItem {
    pub fn cache_key(item_id: u64) -> String {
        format!("item:{}", item_id)
    }
}

/// Failures reported by an origin
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OriginError {
    /// Retryable failure (network, rate limit, 5xx)
    #[error("transient origin failure: {0}")]
    Transient(String),

    #[error("item {0} not found")]
    NotFound(u64),

    /// Credentials rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl OriginError {
    pub fn is_auth(&self) -> bool {
        matches!(self, OriginError::Unauthorized(_))
    }

    /// Map into the crate error for the item being handled
    pub fn into_error(self, item_id: u64) -> Error {
        match self {
            OriginError::Unauthorized(reason) => Error::OriginAuth(reason),
            OriginError::Malformed(reason) => Error::MalformedRecord { item_id, reason },
            OriginError::NotFound(_) => Error::OriginTransient {
                item_id,
                reason: "not found".to_string(),
            },
            OriginError::Transient(reason) => Error::OriginTransient { item_id, reason },
        }
    }
}

/// Remote inventory source
#[async_trait]
pub trait OriginFetcher: Send + Sync {
    /// Up to `limit` item ids greater than `after`, ascending
    async fn fetch_page(
        &self,
        after: Option<u64>,
        limit: usize,
    ) -> std::result::Result<Vec<u64>, OriginError>;

    async fn fetch_item(&self, item_id: u64) -> std::result::Result<ItemRecord, OriginError>;

    /// Raw asset payloads of an item, in display order
    async fn fetch_asset(&self, item_id: u64) -> std::result::Result<Vec<Bytes>, OriginError>;
}

/// Target catalog
#[async_trait]
pub trait DestinationWriter: Send + Sync {
    /// Write an item referencing its stored assets; returns the item reference
    async fn write_item(&self, record: &ItemRecord, asset_refs: &[String]) -> Result<String>;

    /// Store an asset blob; returns the artifact reference
    async fn write_asset(&self, item_id: u64, content: &Bytes) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_origin_error_mapping() {
        assert_matches!(
            OriginError::Unauthorized("401".into()).into_error(3),
            Error::OriginAuth(_)
        );
        assert_matches!(
            OriginError::Malformed("bad json".into()).into_error(3),
            Error::MalformedRecord { item_id: 3, .. }
        );
        assert_matches!(
            OriginError::Transient("timeout".into()).into_error(4),
            Error::OriginTransient { item_id: 4, .. }
        );
        assert!(OriginError::Unauthorized(String::new()).is_auth());
    }

    #[test]
    fn test_record_extra_fields_default() {
        let record: ItemRecord =
            serde_json::from_str(r#"{"id": 1, "sku": "SKU-1", "name": "Lamp"}"#).unwrap();
        assert!(record.fields.is_empty());
        assert_eq!(CachedItem::cache_key(record.id), "item:1");
    }
}
