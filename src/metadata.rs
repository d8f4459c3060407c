//! Persisted cache metadata
//!
//! One small JSON record per cache directory records when the mirror was last
//! checked, what the remote looked like at that point, and which schema
//! version wrote it. A version mismatch always invalidates the cache,
//! independent of timestamps. Corrupt or unreadable metadata is treated as
//! "no cache", never as an error to the caller.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Schema version written by this implementation
///
/// Bumped whenever the persisted layout or the meaning of a field changes;
/// any stored record with a different version forces a full refresh.
pub const METADATA_SCHEMA_VERSION: &str = "2.0";

/// File name of the metadata record inside the cache directory
pub const METADATA_FILE_NAME: &str = "metadata.json";

/// Persisted record describing the last synchronization attempt
///
/// Rewritten wholesale after every attempt; never incrementally patched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// When the mirror was last checked against the remote
    pub last_check: DateTime<Utc>,

    /// Remote Last-Modified observed at that check, when the probe succeeded
    pub last_remote_modified: Option<DateTime<Utc>>,

    /// Schema version of the implementation that wrote this record
    pub schema_version: String,

    /// Remote record count observed at that check, when available
    pub last_record_count: Option<u64>,

    /// Drift threshold in effect when this record was written
    pub drift_threshold_percent: f64,
}

impl CacheMetadata {
    /// True when this record was written by the running schema version
    pub fn schema_matches(&self) -> bool {
        self.schema_version == METADATA_SCHEMA_VERSION
    }
}

/// Handle to the metadata record of one cache directory
#[derive(Clone, Debug)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    /// Create a store for the metadata record inside `cache_dir`
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            path: cache_dir.join(METADATA_FILE_NAME),
        }
    }

    /// Path of the underlying metadata file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted record, tolerating absence and corruption
    ///
    /// Missing, unreadable, or unparseable files yield `Ok(None)` with a
    /// warning; they must trigger a refresh, never crash the caller.
    pub async fn load(&self) -> Option<CacheMetadata> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Cache metadata unreadable, treating as no cache"
                );
                return None;
            }
        };

        match serde_json::from_slice::<CacheMetadata>(&raw) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Cache metadata corrupt, treating as no cache"
                );
                None
            }
        }
    }

    /// Atomically overwrite the persisted record
    ///
    /// Writes to a temp file in the same directory, flushes, then renames.
    /// A crash mid-write leaves either the old record or no record, never a
    /// partially-written file that could later evaluate as valid.
    pub async fn store(&self, metadata: &CacheMetadata) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        let encoded = serde_json::to_vec_pretty(metadata)?;

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&encoded).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;

        tracing::debug!(
            path = %self.path.display(),
            last_check = %metadata.last_check,
            "Cache metadata written"
        );
        Ok(())
    }

    /// Delete the persisted record, ignoring absence
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
