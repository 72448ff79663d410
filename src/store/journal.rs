//! Journaled store - in-memory store with an append-only journal
//!
//! Every successful mutation is appended to `<snapshot>.journal` as one JSON
//! line and synced before the call returns, so a killed process loses at most
//! the write in flight. Opening replays the snapshot and then the journal;
//! [`JournaledStore::compact`] folds the journal into a fresh snapshot.
//!
//! ```text
//! set/delete/upsert ──▶ memory ──▶ journal (append + sync)
//!                                      │ compact
//!                                      ▼
//!                                  snapshot
//! ```

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::memory::{InMemoryDurableStore, StoreStats};
use super::{DurableStore, KeyPattern};
use crate::clock::{add_duration, Clock};
use crate::dedup::{Digest, DigestRecord};
use crate::error::{Error, Result};

/// One journaled mutation
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    Set {
        key: String,
        data: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    },
    Delete {
        key: String,
    },
    Digest {
        record: DigestRecord,
    },
}

/// Durable store persisted through a snapshot plus journal
pub struct JournaledStore {
    inner: InMemoryDurableStore,
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    journal: Mutex<File>,
    /// Entries appended since the last compaction
    appended: AtomicU64,
}

impl JournaledStore {
    /// Open the store at `snapshot_path`, replaying any journal left behind
    pub fn open(snapshot_path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let snapshot_path = snapshot_path.as_ref().to_path_buf();
        let journal_path = journal_path_for(&snapshot_path);

        let inner = InMemoryDurableStore::load_from_file(&snapshot_path, clock)?;
        let replayed = replay(&inner, &journal_path)?;
        if replayed > 0 {
            info!(
                journal = %journal_path.display(),
                entries = replayed,
                "Replayed journal from previous run"
            );
        }

        let journal = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)?;

        Ok(Self {
            inner,
            snapshot_path,
            journal_path,
            journal: Mutex::new(journal),
            appended: AtomicU64::new(replayed),
        })
    }

    /// Fault injection and counters of the underlying store
    pub fn inner(&self) -> &InMemoryDurableStore {
        &self.inner
    }

    pub fn stats(&self) -> StoreStats {
        self.inner.stats()
    }

    pub fn journal_path(&self) -> &Path {
        &self.journal_path
    }

    /// Journal entries not yet folded into the snapshot
    pub fn pending_entries(&self) -> u64 {
        self.appended.load(Ordering::Relaxed)
    }

    /// Write a fresh snapshot and truncate the journal
    pub fn compact(&self) -> Result<()> {
        // Hold the journal so no append lands between snapshot and truncate
        let journal = self.journal.lock();

        let mut tmp = self.snapshot_path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, serde_json::to_vec(&self.inner.snapshot())?)?;
        std::fs::rename(&tmp, &self.snapshot_path)?;

        journal.set_len(0)?;
        journal.sync_all()?;
        let folded = self.appended.swap(0, Ordering::Relaxed);
        debug!(
            snapshot = %self.snapshot_path.display(),
            folded,
            "Journal compacted"
        );
        Ok(())
    }

    fn append(&self, op: &JournalOp) -> Result<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');

        let mut journal = self.journal.lock();
        journal
            .write_all(&line)
            .and_then(|_| journal.sync_data())
            .map_err(|e| Error::store("journal_append", e))?;
        self.appended.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn journal_path_for(snapshot_path: &Path) -> PathBuf {
    let mut path: OsString = snapshot_path.as_os_str().to_owned();
    path.push(".journal");
    PathBuf::from(path)
}

/// Apply journal entries in order; a torn tail ends the replay
fn replay(store: &InMemoryDurableStore, journal_path: &Path) -> Result<u64> {
    if !journal_path.exists() {
        return Ok(0);
    }
    let reader = BufReader::new(File::open(journal_path)?);
    let mut applied = 0;
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let op: JournalOp = match serde_json::from_str(&line) {
            Ok(op) => op,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Ignoring torn journal tail");
                break;
            }
        };
        match op {
            JournalOp::Set {
                key,
                data,
                expires_at,
            } => store.restore_value(&key, Bytes::from(data), expires_at),
            JournalOp::Delete { key } => {
                store.remove_value(&key);
            }
            JournalOp::Digest { record } => store.insert_digest(record),
        }
        applied += 1;
    }
    Ok(applied)
}

#[async_trait]
impl DurableStore for JournaledStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| add_duration(self.inner.clock().now(), ttl));
        self.inner.set_until(key, value.clone(), expires_at).await?;
        self.append(&JournalOp::Set {
            key: key.to_string(),
            data: value.to_vec(),
            expires_at,
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let found = self.inner.delete(key).await?;
        if found {
            self.append(&JournalOp::Delete {
                key: key.to_string(),
            })?;
        }
        Ok(found)
    }

    async fn find_by_pattern(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        self.inner.find_by_pattern(pattern).await
    }

    async fn query_by_digest(
        &self,
        digest: &Digest,
        scope_key: Option<&str>,
    ) -> Result<Option<DigestRecord>> {
        self.inner.query_by_digest(digest, scope_key).await
    }

    async fn upsert_digest(&self, record: &DigestRecord) -> Result<()> {
        self.inner.upsert_digest(record).await?;
        self.append(&JournalOp::Digest {
            record: record.clone(),
        })
    }

    async fn approximate_size(&self) -> Result<u64> {
        self.inner.approximate_size().await
    }
}
