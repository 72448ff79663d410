//! Content digests and the records stored against them

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::error::{Error, Result};

/// Digest length in bytes (SHA-256)
pub const DIGEST_LEN: usize = 32;

/// Fixed-size content hash used as the deduplication key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Hash content
    pub fn of(content: &[u8]) -> Self {
        let mut bytes = [0u8; DIGEST_LEN];
        bytes.copy_from_slice(&Sha256::digest(content));
        Self(bytes)
    }

    /// Parse a hex digest, rejecting anything that is not exactly
    /// `2 * DIGEST_LEN` hex characters
    pub fn parse(hex_digest: &str) -> Result<Self> {
        if hex_digest.len() != DIGEST_LEN * 2 {
            return Err(Error::InvalidDigest(format!(
                "expected {} hex characters, got {}",
                DIGEST_LEN * 2,
                hex_digest.len()
            )));
        }
        let mut bytes = [0u8; DIGEST_LEN];
        hex::decode_to_slice(hex_digest, &mut bytes)
            .map_err(|e| Error::InvalidDigest(format!("{}: {}", hex_digest, e)))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_hex()
    }
}

/// Lookup key of a digest record
///
/// `(digest, scope)` is unique when a scope is present; the digest alone is
/// unique otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub digest: Digest,
    pub scope_key: Option<String>,
}

impl DedupKey {
    pub fn new(digest: Digest, scope_key: Option<&str>) -> Self {
        Self {
            digest,
            scope_key: scope_key.map(str::to_string),
        }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope_key.as_deref()
    }
}

/// A previously stored artifact, keyed by the digest of its content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestRecord {
    pub digest: Digest,
    /// Optional grouping id, e.g. the owning item
    pub scope_key: Option<String>,
    /// Identifier of the stored blob
    pub artifact_ref: String,
    /// Ordering among artifacts of one scope
    pub order_hint: i32,
    pub recorded_at: DateTime<Utc>,
}

impl DigestRecord {
    pub fn new(
        digest: Digest,
        scope_key: Option<String>,
        artifact_ref: impl Into<String>,
        order_hint: i32,
    ) -> Self {
        Self {
            digest,
            scope_key,
            artifact_ref: artifact_ref.into(),
            order_hint,
            recorded_at: Utc::now(),
        }
    }

    pub fn key(&self) -> DedupKey {
        DedupKey {
            digest: self.digest,
            scope_key: self.scope_key.clone(),
        }
    }
}
