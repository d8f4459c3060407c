//! # feedsync
//!
//! Local-mirror synchronizer for bulk vulnerability feeds.
//!
//! ## Design Philosophy
//!
//! feedsync is designed to be:
//! - **Cache-first** - A layered staleness oracle avoids re-downloading
//!   multi-hundred-megabyte feeds that have not meaningfully changed
//! - **Resilient** - Per-chunk retries, per-file failure isolation, and
//!   per-record skip-and-continue; a run fails outright only when no usable
//!   data can be produced at all
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use feedsync::{Config, FeedConfig, FeedSyncer};
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         feed: FeedConfig {
//!             metadata_url: Url::parse("https://feed.example.com/modified")?,
//!             summary_url: Url::parse("https://feed.example.com/summary")?,
//!             files: vec![Url::parse("https://feed.example.com/bulk.ndjson")?],
//!             api_key_header: "apiKey".to_string(),
//!         },
//!         cache: Default::default(),
//!         fetch: Default::default(),
//!         retry: Default::default(),
//!         ingest: Default::default(),
//!     };
//!
//!     let syncer = FeedSyncer::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = syncer.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Parallel chunked fetch engine
pub mod fetcher;
/// Resilient ingestion wrapper
pub mod ingest;
/// Persisted cache metadata
pub mod metadata;
/// Staleness oracle
pub mod oracle;
/// Remote freshness probes
pub mod probe;
/// Progress and telemetry reporting
pub mod reporter;
/// Retry logic with exponential backoff
pub mod retry;
/// Feed synchronizer facade
pub mod syncer;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{CacheConfig, Config, FeedConfig, FetchConfig, IngestConfig, RetryConfig};
pub use error::{Error, FetchError, IngestError, Result};
pub use fetcher::{ChunkTransport, FetchEngine, HttpTransport};
pub use ingest::{FeedRecord, FeedStore, ResilientIngestor};
pub use oracle::{Decision, StalenessOracle};
pub use probe::{HttpProbe, TransportProbe};
pub use reporter::{ConsoleReporter, ProgressObserver, TracingReporter, spawn_event_pump};
pub use syncer::FeedSyncer;
pub use types::{
    DownloadResult, Event, FetchTarget, IngestionStats, RemoteFileInfo, SyncOutcome,
};

/// Helper function to run the synchronizer with graceful signal handling.
///
/// Waits for a termination signal and then calls the syncer's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use feedsync::{Config, FeedConfig, FeedSyncer, run_with_shutdown};
/// use url::Url;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config {
///         feed: FeedConfig {
///             metadata_url: Url::parse("https://feed.example.com/modified")?,
///             summary_url: Url::parse("https://feed.example.com/summary")?,
///             files: vec![Url::parse("https://feed.example.com/bulk.ndjson")?],
///             api_key_header: "apiKey".to_string(),
///         },
///         cache: Default::default(),
///         fetch: Default::default(),
///         retry: Default::default(),
///         ingest: Default::default(),
///     };
///     let syncer = FeedSyncer::new(config).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(syncer).await;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(syncer: FeedSyncer) {
    wait_for_signal().await;
    syncer.shutdown();
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Handler registration can fail in restricted environments (containers,
    // tests); wait on whatever did register
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            let name = tokio::select! {
                _ = sigterm.recv() => "SIGTERM",
                _ = sigint.recv() => "SIGINT",
            };
            tracing::info!(signal = name, "Received termination signal");
        }
        (Ok(mut only), Err(e)) | (Err(e), Ok(mut only)) => {
            tracing::warn!(error = %e, "Only one Unix signal handler registered");
            only.recv().await;
            tracing::info!("Received termination signal");
        }
        (Err(term_err), Err(int_err)) => {
            tracing::warn!(
                sigterm = %term_err,
                sigint = %int_err,
                "No Unix signal handlers available, falling back to ctrl_c"
            );
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!(signal = "ctrl-c", "Received termination signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C"),
    }
}
