//! Resume checkpoints
//!
//! A checkpoint records the last item handled and the counters accumulated
//! so far. It is saved after every item and stored as JSON under
//! `checkpoint:<job_id>` in the durable store.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::DurableStore;

/// Counters accumulated by a job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    /// Items fully processed
    pub processed: u64,
    /// Assets reused through the dedup index
    pub skipped_duplicate: u64,
    /// Items that failed and were skipped
    pub errors: u64,
    /// Assets newly written to the destination
    pub assets_stored: u64,
}

/// Persisted resume marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    /// Id of the last item handled; the next run starts after it
    pub last_processed_cursor: u64,
    pub stats: SyncStats,
    pub saved_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_id: &str, cursor: u64, stats: SyncStats) -> Self {
        Self {
            job_id: job_id.to_string(),
            last_processed_cursor: cursor,
            stats,
            saved_at: Utc::now(),
        }
    }
}

/// Checkpoint persistence over the durable store
pub struct CheckpointStore {
    store: Arc<dyn DurableStore>,
    timeout: Duration,
}

impl CheckpointStore {
    pub fn new(store: Arc<dyn DurableStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    fn key(job_id: &str) -> String {
        format!("checkpoint:{}", job_id)
    }

    fn timed_out(&self, operation: &str) -> Error {
        Error::StoreTimeout {
            operation: operation.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let raw = tokio::time::timeout(self.timeout, self.store.get(&Self::key(job_id)))
            .await
            .map_err(|_| self.timed_out("checkpoint_load"))??;
        raw.map(|raw| serde_json::from_slice(&raw).map_err(Error::from))
            .transpose()
    }

    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let json = Bytes::from(serde_json::to_vec(checkpoint)?);
        tokio::time::timeout(
            self.timeout,
            self.store.set(&Self::key(&checkpoint.job_id), json, None),
        )
        .await
        .map_err(|_| self.timed_out("checkpoint_save"))??;
        debug!(
            job_id = %checkpoint.job_id,
            cursor = checkpoint.last_processed_cursor,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Remove a job's checkpoint, returning whether one existed
    pub async fn clear(&self, job_id: &str) -> Result<bool> {
        tokio::time::timeout(self.timeout, self.store.delete(&Self::key(job_id)))
            .await
            .map_err(|_| self.timed_out("checkpoint_clear"))?
    }
}
