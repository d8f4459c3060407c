//! Configuration types for feedsync

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Top-level configuration
///
/// Every field has a sensible default; the only values without one are the
/// feed endpoints themselves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Remote feed endpoints
    pub feed: FeedConfig,

    /// Local cache and staleness settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Parallel download settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Retry behavior for chunk downloads and store batches
    #[serde(default)]
    pub retry: RetryConfig,

    /// Ingestion behavior
    #[serde(default)]
    pub ingest: IngestConfig,
}

impl Config {
    /// Validate the configuration, rejecting values the engine cannot work with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the offending key.
    pub fn validate(&self) -> Result<()> {
        if self.feed.files.is_empty() {
            return Err(Error::Config {
                message: "at least one feed file URL is required".to_string(),
                key: Some("feed.files".to_string()),
            });
        }
        if self.fetch.chunk_size_bytes == 0 {
            return Err(Error::Config {
                message: "chunk size must be non-zero".to_string(),
                key: Some("fetch.chunk_size_bytes".to_string()),
            });
        }
        if self.fetch.max_concurrency == 0 {
            return Err(Error::Config {
                message: "worker pool size must be non-zero".to_string(),
                key: Some("fetch.max_concurrency".to_string()),
            });
        }
        if !(0.0..=100.0).contains(&self.cache.drift_threshold_percent) {
            return Err(Error::Config {
                message: "drift threshold must be a percentage between 0 and 100".to_string(),
                key: Some("cache.drift_threshold_percent".to_string()),
            });
        }
        if !(0.0..=1.0).contains(&self.ingest.recovery_floor_ratio) {
            return Err(Error::Config {
                message: "recovery floor must be a ratio between 0 and 1".to_string(),
                key: Some("ingest.recovery_floor_ratio".to_string()),
            });
        }
        Ok(())
    }
}

/// Remote feed endpoints
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Lightweight metadata resource exposing a Last-Modified header
    pub metadata_url: Url,

    /// Optionally-authenticated paged summary endpoint; only the total
    /// record count is ever read from its response
    pub summary_url: Url,

    /// Bulk feed file URLs to mirror locally
    pub files: Vec<Url>,

    /// Header used to pass the API key to authenticated endpoints
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

/// Local cache and staleness-oracle settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding downloaded feed files and the metadata record
    /// (default: "./feed-cache")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// How long the local mirror stays valid without any remote check
    /// (default: 4 hours)
    #[serde(default = "default_validity_window", with = "duration_serde")]
    pub validity_window: Duration,

    /// Minimum interval between remote freshness probes (default: 60 minutes)
    ///
    /// Inside this window the oracle answers from metadata alone, with no
    /// network call at all.
    #[serde(default = "default_min_check_interval", with = "duration_serde")]
    pub min_check_interval: Duration,

    /// Without an API key, a remote-modified delta under this slack is
    /// treated as unchanged (default: 1 hour)
    #[serde(default = "default_no_key_modified_slack", with = "duration_serde")]
    pub no_key_modified_slack: Duration,

    /// Without an API key, force a refresh at most once per this interval
    /// (default: 24 hours)
    #[serde(default = "default_no_key_max_age", with = "duration_serde")]
    pub no_key_max_age: Duration,

    /// Record-count drift (percent) above which the mirror is stale
    /// (default: 5.0)
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold_percent: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            validity_window: default_validity_window(),
            min_check_interval: default_min_check_interval(),
            no_key_modified_slack: default_no_key_modified_slack(),
            no_key_max_age: default_no_key_max_age(),
            drift_threshold_percent: default_drift_threshold(),
        }
    }
}

/// Parallel download settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Worker pool size (default: min(4, available cores))
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Chunk size for range-request partitioning (default: 4 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,

    /// TCP connect timeout (default: 10 seconds)
    #[serde(default = "default_connect_timeout", with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Per-request read timeout (default: 60 seconds)
    #[serde(default = "default_read_timeout", with = "duration_serde")]
    pub read_timeout: Duration,

    /// Use byte-range requests when the server advertises support
    /// (default: true)
    #[serde(default = "default_true")]
    pub enable_range_requests: bool,

    /// Emit throttled progress events during downloads (default: true)
    #[serde(default = "default_true")]
    pub enable_progress: bool,

    /// Interval between progress event emissions (default: 500 ms)
    #[serde(default = "default_progress_interval", with = "duration_millis_serde")]
    pub progress_interval: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            chunk_size_bytes: default_chunk_size(),
            connect_timeout: default_connect_timeout(),
            read_timeout: default_read_timeout(),
            enable_range_requests: true,
            enable_progress: true,
            progress_interval: default_progress_interval(),
        }
    }
}

/// Retry configuration for chunk downloads
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first try (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 500 ms)
    #[serde(default = "default_initial_delay", with = "duration_millis_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Ingestion behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Records per store batch; kept deliberately small so one bad page has
    /// a small blast radius (default: 64)
    #[serde(default = "default_resilient_batch_size")]
    pub resilient_batch_size: usize,

    /// Skip undecodable records instead of aborting the run (default: true)
    #[serde(default = "default_true")]
    pub lenient_decoding: bool,

    /// During manual recovery, the existing store counts as well populated
    /// when it holds at least this fraction of the estimated total
    /// (default: 0.8)
    #[serde(default = "default_recovery_floor")]
    pub recovery_floor_ratio: f64,

    /// Store-batch retry attempts before a batch is declared failed
    /// (default: 2)
    #[serde(default = "default_ingest_retries")]
    pub max_retries: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            resilient_batch_size: default_resilient_batch_size(),
            lenient_decoding: true,
            recovery_floor_ratio: default_recovery_floor(),
            max_retries: default_ingest_retries(),
        }
    }
}

fn default_api_key_header() -> String {
    "apiKey".to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./feed-cache")
}

fn default_validity_window() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}

fn default_min_check_interval() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_no_key_modified_slack() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_no_key_max_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_drift_threshold() -> f64 {
    5.0
}

fn default_max_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(4)
}

fn default_chunk_size() -> u64 {
    4 * 1024 * 1024
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_resilient_batch_size() -> usize {
    64
}

fn default_recovery_floor() -> f64 {
    0.8
}

fn default_ingest_retries() -> u32 {
    2
}

// Duration serialization helper (seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for sub-second intervals)
mod duration_millis_serde {
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
