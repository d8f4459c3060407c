//! Feed synchronizer facade
//!
//! [`FeedSyncer`] wires the staleness oracle, the fetch engine, and the
//! resilient ingestor together behind a small API. `sync()` is the one call
//! most consumers need: ask the oracle, refresh the mirror when it says so,
//! ingest, and persist the new freshness baseline.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::{FetchEngine, HttpTransport};
use crate::ingest::{FeedStore, ResilientIngestor};
use crate::oracle::StalenessOracle;
use crate::probe::HttpProbe;
use crate::types::{Event, FetchTarget, SyncOutcome};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use url::Url;

/// Capacity of the broadcast event channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Main synchronizer over one configured feed
///
/// Cheap to clone; all components live behind `Arc`s and share one event
/// channel.
#[derive(Clone)]
pub struct FeedSyncer {
    config: Arc<Config>,
    oracle: Arc<StalenessOracle>,
    engine: Arc<FetchEngine>,
    ingestor: Arc<ResilientIngestor>,
    event_tx: broadcast::Sender<Event>,
    shutdown_done: Arc<AtomicBool>,
}

impl FeedSyncer {
    /// Build a synchronizer from a validated configuration
    ///
    /// Creates the cache directory when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error when the configuration is invalid, the cache
    /// directory cannot be created, or the HTTP clients fail to build.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.cache.cache_dir).await?;

        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let probe = Arc::new(HttpProbe::new(&config)?);
        let transport = Arc::new(HttpTransport::new(&config)?);
        let oracle = Arc::new(StalenessOracle::new(&config, probe));
        let engine = Arc::new(FetchEngine::new(
            config.fetch.clone(),
            config.retry.clone(),
            transport,
            event_tx.clone(),
        ));
        let ingestor = Arc::new(ResilientIngestor::new(
            config.ingest.clone(),
            event_tx.clone(),
        ));

        tracing::info!(
            cache_dir = %config.cache.cache_dir.display(),
            files = config.feed.files.len(),
            "Feed synchronizer initialized"
        );
        Ok(Self {
            config: Arc::new(config),
            oracle,
            engine,
            ingestor,
            event_tx,
            shutdown_done: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Subscribe to synchronization events
    ///
    /// Slow consumers lag and drop events rather than blocking the pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Local-only freshness check; never touches the network
    pub async fn is_local_cache_valid(&self) -> bool {
        self.oracle.is_locally_fresh().await
    }

    /// Full freshness check: local metadata first, remote probes second
    ///
    /// Network probes run only when the local check passes; probe failures
    /// degrade to trusting the cache.
    pub async fn is_cache_valid(&self, api_key: Option<&str>) -> bool {
        self.oracle.is_locally_fresh().await && self.oracle.is_remote_fresh(api_key).await
    }

    /// Download every configured feed file into the cache directory
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] after `shutdown()`. Per-file failures
    /// surface in the returned result, not as errors.
    pub async fn fetch_all(&self, api_key: Option<&str>) -> Result<crate::types::DownloadResult> {
        self.engine.fetch_all(&self.targets(), api_key).await
    }

    /// Apply the cached payload files to the given store
    ///
    /// # Errors
    ///
    /// Escalates only when the resilient wrapper and its recovery path both
    /// fail to produce usable data.
    pub async fn ingest(&self, store: &dyn FeedStore) -> Result<crate::types::IngestionStats> {
        let payloads: Vec<PathBuf> = self.targets().into_iter().map(|t| t.dest).collect();
        Ok(self.ingestor.apply(&payloads, store).await?)
    }

    /// One full synchronization pass
    ///
    /// Asks the oracle first; a fresh mirror short-circuits to
    /// [`SyncOutcome::CacheHit`] without downloading anything. Otherwise the
    /// feed files are fetched, ingested into `store`, and the freshness
    /// baseline is persisted. Partial download or ingestion failures that
    /// still produce usable data come back as [`SyncOutcome::Partial`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoUsableData`] when every layer of recovery failed
    /// and the store holds nothing usable, [`Error::ShuttingDown`] after
    /// `shutdown()`, or an I/O error when the new metadata record cannot be
    /// persisted.
    pub async fn sync(&self, store: &dyn FeedStore, api_key: Option<&str>) -> Result<SyncOutcome> {
        self.event_tx.send(Event::SyncStarted).ok();

        let local = self.oracle.check_local().await;
        if local.fresh {
            let remote = self.oracle.check_remote(api_key).await;
            if remote.fresh {
                tracing::info!(reason = %remote.reason, "Cache hit, skipping refresh");
                self.event_tx
                    .send(Event::CacheHit { reason: remote.reason.clone() })
                    .ok();
                return Ok(SyncOutcome::CacheHit { reason: remote.reason });
            }
            self.refresh(store, api_key, remote.reason).await
        } else {
            self.refresh(store, api_key, local.reason).await
        }
    }

    async fn refresh(
        &self,
        store: &dyn FeedStore,
        api_key: Option<&str>,
        reason: String,
    ) -> Result<SyncOutcome> {
        tracing::info!(reason = %reason, "Refreshing local mirror");
        self.event_tx.send(Event::RefreshNeeded { reason }).ok();

        let download = self.fetch_all(api_key).await?;

        // Ingest whatever arrived; a partial download can still carry the
        // bulk of the feed
        let stats = match self.ingest(store).await {
            Ok(stats) => stats,
            Err(e) => {
                // The resilient wrapper already exhausted its recovery path
                let message = match &download.error_message {
                    Some(fetch_error) => format!(
                        "download failed ({fetch_error}) and ingestion found no usable data"
                    ),
                    None => "ingestion failed beyond recovery".to_string(),
                };
                return Err(Error::NoUsableData {
                    message,
                    source: Some(Box::new(e)),
                });
            }
        };

        // New baseline: what the store actually holds now
        let baseline = store.record_count().await.ok();
        self.oracle.record_success(baseline).await?;

        if download.success {
            Ok(SyncOutcome::Refreshed { download, stats })
        } else {
            let error = download
                .error_message
                .clone()
                .unwrap_or_else(|| "some files failed to download".to_string());
            tracing::warn!(error = %error, "Sync finished partially");
            Ok(SyncOutcome::Partial {
                download,
                stats: Some(stats),
                error,
            })
        }
    }

    /// Persist a new freshness baseline after an externally-driven refresh
    ///
    /// `sync()` does this automatically; callers that drive `fetch_all` and
    /// `ingest` themselves call it once their store is up to date.
    ///
    /// # Errors
    ///
    /// Returns an error when the metadata record cannot be written.
    pub async fn record_success(&self, record_count: Option<u64>) -> Result<()> {
        self.oracle.record_success(record_count).await
    }

    /// Delete the persisted metadata and every cached feed file
    ///
    /// The next `sync()` is guaranteed to refresh.
    ///
    /// # Errors
    ///
    /// Returns an error when cache files cannot be removed.
    pub async fn clear_cache(&self) -> Result<()> {
        self.oracle.clear().await
    }

    /// Stop accepting new work and interrupt in-flight downloads
    ///
    /// Idempotent; later `fetch_all`/`sync` calls fail with
    /// [`Error::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Feed synchronizer shutting down");
        self.engine.shutdown();
        self.event_tx.send(Event::Shutdown).ok();
    }

    /// Map each configured feed URL to its destination in the cache directory
    fn targets(&self) -> Vec<FetchTarget> {
        self.config
            .feed
            .files
            .iter()
            .enumerate()
            .map(|(i, url)| FetchTarget {
                url: url.clone(),
                dest: self.config.cache.cache_dir.join(dest_file_name(url, i)),
            })
            .collect()
    }
}

/// Local file name for a feed URL: its last path segment, or a positional
/// name when the URL has none
fn dest_file_name(url: &Url, index: usize) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|segment| !segment.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("feed-{index}.ndjson"))
}
