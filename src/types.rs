//! Core types and events for feedsync

use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Status of a single chunk download task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for a worker
    Pending,
    /// Currently downloading
    InFlight,
    /// Successfully written to the destination
    Done,
    /// Retry budget exhausted
    Failed,
}

/// Transient descriptor for one chunk of one file
///
/// The set of tasks created for a file is an exact, non-overlapping partition
/// of `[0, file_size)`; tasks are discarded once the file is assembled or
/// abandoned.
#[derive(Clone, Debug)]
pub struct DownloadTask {
    /// Source URL of the owning file
    pub url: Url,
    /// Byte range `[start, end)` this task covers
    pub range: Range<u64>,
    /// Destination offset (equals `range.start`; chunks land in place)
    pub offset: u64,
    /// Attempts made so far, including the first
    pub attempt: u32,
    /// Current task status
    pub status: TaskStatus,
}

impl DownloadTask {
    /// Number of bytes this task is responsible for
    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    /// True when the task covers no bytes (never produced by partitioning)
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Remote file facts learned from a probe request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFileInfo {
    /// Content length in bytes
    pub len: u64,
    /// Whether the server advertises byte-range support
    pub accepts_ranges: bool,
}

/// One file to mirror: its source URL and local destination
#[derive(Clone, Debug)]
pub struct FetchTarget {
    /// Source URL
    pub url: Url,
    /// Destination path inside the cache directory
    pub dest: PathBuf,
}

/// Aggregate outcome of a `fetch_all` run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadResult {
    /// True only when every requested file completed
    pub success: bool,
    /// Number of files fully downloaded
    pub files_downloaded: usize,
    /// Bytes written by successfully completed chunks only
    pub total_bytes: u64,
    /// Wall-clock duration of the whole run
    #[serde(with = "millis_serde")]
    pub duration: Duration,
    /// Average throughput in megabits per second
    pub avg_throughput_mbps: f64,
    /// First fatal cause when `success` is false
    pub error_message: Option<String>,
}

impl DownloadResult {
    /// Derive the aggregate result from per-run measurements
    pub fn from_measurements(
        files_requested: usize,
        files_downloaded: usize,
        total_bytes: u64,
        duration: Duration,
        error_message: Option<String>,
    ) -> Self {
        let secs = duration.as_secs_f64();
        let avg_throughput_mbps = if secs > 0.0 {
            (total_bytes as f64 * 8.0) / secs / 1_000_000.0
        } else {
            0.0
        };
        Self {
            success: files_downloaded == files_requested && error_message.is_none(),
            files_downloaded,
            total_bytes,
            duration,
            avg_throughput_mbps,
            error_message,
        }
    }
}

/// Per-run ingestion counters
///
/// Owned by the run and shared only with its direct collaborators; created at
/// the start of an ingestion run, reported and discarded at the end.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestionStats {
    /// Records successfully applied to the store
    pub processed: u64,
    /// Records skipped due to decode failures
    pub skipped: u64,
    /// Estimated total records in the payload, when known
    pub estimated_total: Option<u64>,
}

impl IngestionStats {
    /// Completion rate as a percentage, for reporting only
    ///
    /// Never gates success or failure.
    pub fn completion_rate(&self) -> Option<f64> {
        match self.estimated_total {
            Some(total) if total > 0 => Some(self.processed as f64 / total as f64 * 100.0),
            _ => None,
        }
    }
}

/// Structured outcome of one full synchronization pass
#[derive(Clone, Debug)]
pub enum SyncOutcome {
    /// The local mirror was fresh; nothing was downloaded
    CacheHit {
        /// Why the oracle trusted the cache
        reason: String,
    },
    /// The mirror was refreshed and ingested completely
    Refreshed {
        /// Download measurements
        download: DownloadResult,
        /// Ingestion counters
        stats: IngestionStats,
    },
    /// Some files or records failed but usable data was produced
    Partial {
        /// Download measurements (possibly with failed files)
        download: DownloadResult,
        /// Ingestion counters when ingestion ran
        stats: Option<IngestionStats>,
        /// First fatal cause
        error: String,
    },
}

/// Events emitted during synchronization
///
/// Subscribe via `FeedSyncer::subscribe()`. Events are broadcast; slow
/// consumers lag and drop rather than blocking producers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A synchronization pass started
    SyncStarted,

    /// The oracle decided the local mirror is fresh
    CacheHit {
        /// Which check matched
        reason: String,
    },

    /// The oracle decided a refresh is needed
    RefreshNeeded {
        /// Which check failed
        reason: String,
    },

    /// Downloads are starting
    FetchStarted {
        /// Number of files in the batch
        files: usize,
        /// Total bytes across all files, when all probes succeeded
        total_bytes: Option<u64>,
    },

    /// Throttled aggregate download progress
    FetchProgress {
        /// Bytes transferred so far across all in-flight tasks
        bytes: u64,
        /// Total bytes expected, when known
        total_bytes: Option<u64>,
        /// Progress percentage (0.0 to 100.0) when the total is known
        percent: Option<f32>,
        /// Current speed in bytes per second
        speed_bps: u64,
    },

    /// One file finished downloading
    FileComplete {
        /// Source URL
        url: Url,
        /// Bytes written
        bytes: u64,
    },

    /// One file failed permanently; sibling files continue
    FileFailed {
        /// Source URL
        url: Url,
        /// Failure description
        error: String,
    },

    /// The whole download batch finished
    FetchComplete {
        /// True when every file completed
        success: bool,
        /// Files fully downloaded
        files_downloaded: usize,
        /// Bytes written by completed chunks
        total_bytes: u64,
    },

    /// Ingestion started
    IngestStarted {
        /// Estimated total records, when known
        estimated_total: Option<u64>,
    },

    /// Throttled ingestion progress
    IngestProgress {
        /// Records applied so far
        processed: u64,
        /// Records skipped so far
        skipped: u64,
    },

    /// Ingestion finished
    IngestComplete {
        /// Records applied
        processed: u64,
        /// Records skipped
        skipped: u64,
        /// Completion rate percentage, when an estimate existed
        completion_rate: Option<f64>,
    },

    /// Ingestion failed beyond recovery
    IngestFailed {
        /// Failure description
        error: String,
    },

    /// The syncer is shutting down
    Shutdown,
}

// Duration-as-milliseconds helper for serialized results
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
