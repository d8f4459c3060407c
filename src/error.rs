//! Error types for feedsync
//!
//! This module provides the error taxonomy for the library:
//! - Domain-specific error types (Fetch, Ingest)
//! - Connectivity passthrough variants that keep the original cause chain
//! - A single hard-failure variant (`NoUsableData`) for the one case that
//!   must reach the caller

use std::ops::Range;
use thiserror::Error;
use url::Url;

/// Result type alias for feedsync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for feedsync
///
/// This is the primary error type used throughout the library. Each variant
/// keeps its underlying cause via `#[from]`/`#[source]` so callers (and the
/// ingestion defect classifier) can walk the full chain.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fetch.chunk_size_bytes")
        key: Option<String>,
    },

    /// Download-related error
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Ingestion-related error
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// No network reachable and no usable local data
    ///
    /// The only total-failure case: every recovery layer (cache trust,
    /// per-chunk retry, per-record skip, manual store recovery) has been
    /// exhausted.
    #[error("no usable feed data: {message}")]
    NoUsableData {
        /// Summary of what was attempted
        message: String,
        /// Root cause, when one exists
        #[source]
        source: Option<Box<Error>>,
    },

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Download-related errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// Probing a remote file for size/range support failed
    #[error("probe of {url} failed: {reason}")]
    Probe {
        /// File that was being probed
        url: Url,
        /// What went wrong
        reason: String,
    },

    /// Server answered a ranged request without honoring the range
    #[error("{url} does not support range requests")]
    RangeNotSupported {
        /// File that was being fetched
        url: Url,
    },

    /// Unexpected HTTP status for a feed request
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus {
        /// File that was being fetched
        url: Url,
        /// Status code returned by the server
        status: u16,
    },

    /// Server returned fewer bytes than the requested range
    #[error("short read from {url}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// File that was being fetched
        url: Url,
        /// Bytes the range asked for
        expected: u64,
        /// Bytes actually received
        actual: u64,
    },

    /// A chunk exhausted its retry budget
    #[error("chunk {range:?} of {url} failed after {attempts} attempts")]
    ChunkExhausted {
        /// File the chunk belongs to
        url: Url,
        /// Byte range of the chunk
        range: Range<u64>,
        /// Attempts made, including the first
        attempts: u32,
        /// Last error seen
        #[source]
        source: Box<FetchError>,
    },

    /// Download was canceled by shutdown
    #[error("download canceled")]
    Canceled,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error writing a chunk to its destination
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ingestion-related errors
#[derive(Debug, Error)]
pub enum IngestError {
    /// A single record failed to decode (recoverable, record is skipped)
    #[error("record decode failed at line {line}: {reason}")]
    Decode {
        /// 1-based line number within the payload
        line: u64,
        /// Decoder message
        reason: String,
    },

    /// The store rejected a batch of records
    #[error("store rejected batch: {message}")]
    Store {
        /// Store-supplied message (matched against the defect-signature table)
        message: String,
        /// Underlying store error, when available
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The downloaded payload contained no records at all
    #[error("downloaded payload is empty: {0}")]
    EmptyPayload(String),

    /// Manual recovery after a known-defect failure did not find usable data
    #[error("recovery after {category} failure did not yield usable data")]
    RecoveryFailed {
        /// Classified defect category that triggered recovery
        category: String,
        /// The original ingestion failure
        #[source]
        source: Box<IngestError>,
    },

    /// I/O error reading the downloaded payload
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collect the display strings of an error and every cause beneath it
///
/// Used by the ingestion wrapper's defect-signature matching, which inspects
/// the whole chain rather than just the top-level message.
pub fn cause_chain(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = Some(error);
    while let Some(err) = current {
        chain.push(err.to_string());
        current = err.source();
    }
    chain
}

impl Error {
    /// Collect the display strings of this error and every cause beneath it
    pub fn cause_chain(&self) -> Vec<String> {
        cause_chain(self)
    }
}
