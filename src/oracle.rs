//! Staleness oracle
//!
//! Decides "use cache" vs "refresh needed" through a ladder of checks ordered
//! cheapest first: persisted metadata alone, then a remote Last-Modified
//! probe, then a record-count drift comparison. Any probe failure degrades to
//! trusting the local cache; the oracle itself never errors on a freshness
//! question.

use crate::config::{CacheConfig, Config};
use crate::error::Result;
use crate::metadata::{CacheMetadata, MetadataStore, METADATA_FILE_NAME, METADATA_SCHEMA_VERSION};
use crate::probe::TransportProbe;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Outcome of one freshness check, with the matching rule for reporting
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// True when the local mirror can be used as-is
    pub fresh: bool,
    /// Which check decided (surfaced in events and logs)
    pub reason: String,
}

impl Decision {
    fn fresh(reason: impl Into<String>) -> Self {
        Self { fresh: true, reason: reason.into() }
    }

    fn stale(reason: impl Into<String>) -> Self {
        Self { fresh: false, reason: reason.into() }
    }
}

/// Remote signals observed during the most recent probe
///
/// Carried into `record_success` so the persisted metadata reflects what the
/// oracle actually saw, without a second network round trip.
#[derive(Clone, Copy, Debug, Default)]
struct Observed {
    modified: Option<DateTime<Utc>>,
    count: Option<u64>,
}

/// Layered staleness decisions over persisted metadata and remote probes
pub struct StalenessOracle {
    cache: CacheConfig,
    cache_dir: PathBuf,
    metadata: MetadataStore,
    probe: Arc<dyn TransportProbe>,
    observed: Mutex<Observed>,
}

impl StalenessOracle {
    /// Build an oracle over the configured cache directory and a probe
    pub fn new(config: &Config, probe: Arc<dyn TransportProbe>) -> Self {
        Self {
            cache: config.cache.clone(),
            cache_dir: config.cache.cache_dir.clone(),
            metadata: MetadataStore::new(&config.cache.cache_dir),
            probe,
            observed: Mutex::new(Observed::default()),
        }
    }

    /// Local-only freshness check; no network, ever
    ///
    /// Stale when metadata is absent, written by a different schema version,
    /// or older than the configured validity window.
    pub async fn check_local(&self) -> Decision {
        let Some(metadata) = self.metadata.load().await else {
            return Decision::stale("no cache metadata");
        };

        if !metadata.schema_matches() {
            return Decision::stale(format!(
                "schema version {} does not match running {}",
                metadata.schema_version, METADATA_SCHEMA_VERSION
            ));
        }

        let age = Utc::now().signed_duration_since(metadata.last_check);
        let window = chrono_from_std(self.cache.validity_window);
        if age > window {
            return Decision::stale(format!(
                "last check {} exceeds validity window",
                metadata.last_check
            ));
        }

        Decision::fresh("metadata within validity window")
    }

    /// Remote freshness check; assumes [`check_local`](Self::check_local)
    /// already passed
    ///
    /// Decision order, first match wins:
    /// 1. last check within the minimum-check interval — fresh, no network
    /// 2. remote Last-Modified unchanged — fresh
    /// 3. with an API key: record-count drift below the threshold — fresh
    /// 4. without a key: modified delta under the slack — fresh; otherwise
    ///    force one refresh per `no_key_max_age`
    /// 5. any probe failure — trust the local cache
    pub async fn check_remote(&self, api_key: Option<&str>) -> Decision {
        let Some(metadata) = self.metadata.load().await else {
            return Decision::stale("no cache metadata");
        };

        // 1. Recently checked: answer without any network call
        let since_check = Utc::now().signed_duration_since(metadata.last_check);
        if since_check < chrono_from_std(self.cache.min_check_interval) {
            return Decision::fresh("within minimum check interval");
        }

        // 2. Probe remote Last-Modified
        let remote_modified = match self.probe.remote_modified().await {
            Ok(modified) => modified,
            Err(e) => {
                tracing::warn!(error = %e, "Freshness probe failed, trusting local cache");
                return Decision::fresh("probe failed, trusting cache");
            }
        };
        if let Some(modified) = remote_modified {
            self.observed.lock().await.modified = Some(modified);
        }

        let unchanged = match (remote_modified, metadata.last_remote_modified) {
            (Some(remote), Some(stored)) => remote <= stored,
            // Nothing to compare; fall through to the drift/fallback checks
            _ => false,
        };
        if unchanged {
            return Decision::fresh("remote Last-Modified unchanged");
        }

        // 3. With an API key: measure record-count drift
        if let Some(key) = api_key {
            return self.drift_decision(&metadata, key).await;
        }

        // 4. Without a key: conservative fallback
        if let (Some(remote), Some(stored)) = (remote_modified, metadata.last_remote_modified) {
            let delta = remote.signed_duration_since(stored);
            if delta < chrono_from_std(self.cache.no_key_modified_slack) {
                return Decision::fresh("remote modified delta within slack");
            }
        }
        if since_check < chrono_from_std(self.cache.no_key_max_age) {
            return Decision::fresh("refresh deferred until no-key max age");
        }
        Decision::stale("no API key and no-key max age exceeded")
    }

    async fn drift_decision(&self, metadata: &CacheMetadata, api_key: &str) -> Decision {
        let remote_count = match self.probe.record_count(Some(api_key)).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!(error = %e, "Record-count probe failed, trusting local cache");
                return Decision::fresh("count probe failed, trusting cache");
            }
        };
        self.observed.lock().await.count = Some(remote_count);

        let Some(last_count) = metadata.last_record_count else {
            return Decision::stale("remote changed and no baseline record count");
        };

        // Single last-observed count, no smoothing across syncs
        let drift = if last_count == 0 {
            if remote_count == 0 { 0.0 } else { f64::INFINITY }
        } else {
            (remote_count as f64 - last_count as f64).abs() / last_count as f64 * 100.0
        };

        if drift < metadata.drift_threshold_percent {
            Decision::fresh(format!("record-count drift {drift:.1}% below threshold"))
        } else {
            Decision::stale(format!("record-count drift {drift:.1}% at or above threshold"))
        }
    }

    /// `check_local` reduced to the caller-facing boolean
    pub async fn is_locally_fresh(&self) -> bool {
        self.check_local().await.fresh
    }

    /// `check_remote` reduced to the caller-facing boolean
    pub async fn is_remote_fresh(&self, api_key: Option<&str>) -> bool {
        self.check_remote(api_key).await.fresh
    }

    /// Overwrite the persisted metadata after a successful synchronization
    ///
    /// Records the current time, the running schema version, the configured
    /// threshold, and the most recently observed remote-modified time and
    /// record count. When no remote-modified value was observed during this
    /// pass, one best-effort probe fills it in.
    pub async fn record_success(&self, record_count: Option<u64>) -> Result<()> {
        let observed = *self.observed.lock().await;

        let last_remote_modified = match observed.modified {
            Some(modified) => Some(modified),
            None => self.probe.remote_modified().await.unwrap_or_else(|e| {
                tracing::debug!(error = %e, "Post-sync modified probe failed, storing none");
                None
            }),
        };

        let metadata = CacheMetadata {
            last_check: Utc::now(),
            last_remote_modified,
            schema_version: METADATA_SCHEMA_VERSION.to_string(),
            last_record_count: record_count.or(observed.count),
            drift_threshold_percent: self.cache.drift_threshold_percent,
        };
        self.metadata.store(&metadata).await?;

        tracing::info!(
            last_remote_modified = ?metadata.last_remote_modified,
            last_record_count = ?metadata.last_record_count,
            "Cache metadata updated after successful sync"
        );
        Ok(())
    }

    /// Delete persisted metadata and every cached feed file
    pub async fn clear(&self) -> Result<()> {
        self.metadata.clear().await?;

        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && entry.file_name() != METADATA_FILE_NAME {
                tokio::fs::remove_file(&path).await?;
                tracing::debug!(path = %path.display(), "Removed cached feed file");
            }
        }

        tracing::info!(cache_dir = %self.cache_dir.display(), "Cache cleared");
        Ok(())
    }
}

fn chrono_from_std(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::MAX)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FeedConfig, FetchConfig, IngestConfig, RetryConfig};
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use url::Url;

    /// Programmable probe that counts every network-equivalent call
    struct FakeProbe {
        modified: Option<DateTime<Utc>>,
        count: Option<u64>,
        fail: bool,
        modified_calls: AtomicU32,
        count_calls: AtomicU32,
    }

    impl FakeProbe {
        fn new(modified: Option<DateTime<Utc>>, count: Option<u64>) -> Self {
            Self {
                modified,
                count,
                fail: false,
                modified_calls: AtomicU32::new(0),
                count_calls: AtomicU32::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                modified: None,
                count: None,
                fail: true,
                modified_calls: AtomicU32::new(0),
                count_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TransportProbe for FakeProbe {
        async fn remote_modified(&self) -> Result<Option<DateTime<Utc>>> {
            self.modified_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Other("connection refused".to_string()));
            }
            Ok(self.modified)
        }

        async fn record_count(&self, _api_key: Option<&str>) -> Result<u64> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Other("connection refused".to_string()));
            }
            self.count
                .ok_or_else(|| Error::Other("no count configured".to_string()))
        }
    }

    fn test_config(cache_dir: &std::path::Path) -> Config {
        let cache = CacheConfig {
            cache_dir: cache_dir.to_path_buf(),
            ..CacheConfig::default()
        };
        Config {
            feed: FeedConfig {
                metadata_url: Url::parse("https://feed.example.com/modified").unwrap(),
                summary_url: Url::parse("https://feed.example.com/summary").unwrap(),
                files: vec![Url::parse("https://feed.example.com/bulk.ndjson").unwrap()],
                api_key_header: "apiKey".to_string(),
            },
            cache,
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
            ingest: IngestConfig::default(),
        }
    }

    async fn write_metadata(cache_dir: &std::path::Path, metadata: &CacheMetadata) {
        MetadataStore::new(cache_dir).store(metadata).await.unwrap();
    }

    fn metadata_checked_at(
        last_check: DateTime<Utc>,
        modified: Option<DateTime<Utc>>,
        count: Option<u64>,
    ) -> CacheMetadata {
        CacheMetadata {
            last_check,
            last_remote_modified: modified,
            schema_version: METADATA_SCHEMA_VERSION.to_string(),
            last_record_count: count,
            drift_threshold_percent: 5.0,
        }
    }

    #[tokio::test]
    async fn absent_metadata_is_locally_stale() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = StalenessOracle::new(
            &test_config(dir.path()),
            Arc::new(FakeProbe::new(None, None)),
        );
        assert!(!oracle.is_locally_fresh().await);
    }

    #[tokio::test]
    async fn schema_mismatch_forces_refresh_even_when_just_checked() {
        let dir = tempfile::tempdir().unwrap();
        let mut metadata = metadata_checked_at(Utc::now(), None, None);
        metadata.schema_version = "1.0".to_string();
        write_metadata(dir.path(), &metadata).await;

        let oracle = StalenessOracle::new(
            &test_config(dir.path()),
            Arc::new(FakeProbe::new(None, None)),
        );
        let decision = oracle.check_local().await;
        assert!(!decision.fresh, "zero-age metadata with version 1.0 must be stale");
        assert!(decision.reason.contains("schema version"));
    }

    #[tokio::test]
    async fn stale_check_time_fails_local() {
        let dir = tempfile::tempdir().unwrap();
        let old = Utc::now() - ChronoDuration::hours(5);
        write_metadata(dir.path(), &metadata_checked_at(old, None, None)).await;

        let oracle = StalenessOracle::new(
            &test_config(dir.path()),
            Arc::new(FakeProbe::new(None, None)),
        );
        assert!(!oracle.is_locally_fresh().await, "4h validity window exceeded");
    }

    #[tokio::test]
    async fn recent_check_skips_network_entirely() {
        let dir = tempfile::tempdir().unwrap();
        write_metadata(dir.path(), &metadata_checked_at(Utc::now(), None, None)).await;

        let probe = Arc::new(FakeProbe::new(None, None));
        let oracle = StalenessOracle::new(&test_config(dir.path()), probe.clone());

        assert!(oracle.is_remote_fresh(None).await);
        assert_eq!(probe.modified_calls.load(Ordering::SeqCst), 0);
        assert_eq!(probe.count_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unchanged_remote_modified_is_fresh_and_skips_drift_check() {
        let dir = tempfile::tempdir().unwrap();
        let modified = Utc::now() - ChronoDuration::days(2);
        let checked = Utc::now() - ChronoDuration::hours(2);
        write_metadata(
            dir.path(),
            &metadata_checked_at(checked, Some(modified), Some(1000)),
        )
        .await;

        let probe = Arc::new(FakeProbe::new(Some(modified), Some(5000)));
        let mut config = test_config(dir.path());
        config.cache.validity_window = std::time::Duration::from_secs(10 * 60 * 60);
        let oracle = StalenessOracle::new(&config, probe.clone());

        // Idempotence: two consecutive checks, neither reaches the count endpoint
        assert!(oracle.is_remote_fresh(Some("key")).await);
        assert!(oracle.is_remote_fresh(Some("key")).await);
        assert_eq!(probe.count_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn drift_below_threshold_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let stored_modified = Utc::now() - ChronoDuration::days(2);
        let checked = Utc::now() - ChronoDuration::hours(2);
        write_metadata(
            dir.path(),
            &metadata_checked_at(checked, Some(stored_modified), Some(1000)),
        )
        .await;

        // Remote moved forward; count 1049 = 4.9% drift
        let probe = Arc::new(FakeProbe::new(Some(Utc::now()), Some(1049)));
        let oracle = StalenessOracle::new(&test_config(dir.path()), probe);
        let decision = oracle.check_remote(Some("key")).await;
        assert!(decision.fresh, "4.9% drift is below the 5% threshold: {}", decision.reason);
    }

    #[tokio::test]
    async fn drift_at_or_above_threshold_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let stored_modified = Utc::now() - ChronoDuration::days(2);
        let checked = Utc::now() - ChronoDuration::hours(2);
        write_metadata(
            dir.path(),
            &metadata_checked_at(checked, Some(stored_modified), Some(1000)),
        )
        .await;

        // Count 1051 = 5.1% drift
        let probe = Arc::new(FakeProbe::new(Some(Utc::now()), Some(1051)));
        let oracle = StalenessOracle::new(&test_config(dir.path()), probe);
        assert!(!oracle.is_remote_fresh(Some("key")).await);
    }

    #[tokio::test]
    async fn no_key_small_delta_is_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let stored_modified = Utc::now() - ChronoDuration::minutes(90);
        let checked = Utc::now() - ChronoDuration::hours(2);
        write_metadata(
            dir.path(),
            &metadata_checked_at(checked, Some(stored_modified), None),
        )
        .await;

        // Remote moved 30 minutes past the stored value: within the 1h slack
        let remote = stored_modified + ChronoDuration::minutes(30);
        let probe = Arc::new(FakeProbe::new(Some(remote), None));
        let oracle = StalenessOracle::new(&test_config(dir.path()), probe);
        let decision = oracle.check_remote(None).await;
        assert!(decision.fresh, "{}", decision.reason);
    }

    #[tokio::test]
    async fn no_key_large_delta_forces_refresh_after_max_age() {
        let dir = tempfile::tempdir().unwrap();
        let checked = Utc::now() - ChronoDuration::hours(25);
        let stored_modified = Utc::now() - ChronoDuration::days(3);
        write_metadata(
            dir.path(),
            &metadata_checked_at(checked, Some(stored_modified), None),
        )
        .await;

        let probe = Arc::new(FakeProbe::new(Some(Utc::now()), None));
        let mut config = test_config(dir.path());
        // Keep locally-fresh semantics out of the way for this remote-only test
        config.cache.validity_window = std::time::Duration::from_secs(48 * 60 * 60);
        let oracle = StalenessOracle::new(&config, probe);

        let decision = oracle.check_remote(None).await;
        assert!(!decision.fresh, "25h since last check exceeds the 24h max age");
    }

    #[tokio::test]
    async fn probe_failure_trusts_cache() {
        let dir = tempfile::tempdir().unwrap();
        let checked = Utc::now() - ChronoDuration::hours(2);
        write_metadata(dir.path(), &metadata_checked_at(checked, None, None)).await;

        let oracle =
            StalenessOracle::new(&test_config(dir.path()), Arc::new(FakeProbe::failing()));
        let decision = oracle.check_remote(Some("key")).await;
        assert!(decision.fresh, "network errors degrade to trusting the cache");
    }

    #[tokio::test]
    async fn record_success_overwrites_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new(Some(Utc::now()), None));
        let oracle = StalenessOracle::new(&test_config(dir.path()), probe);

        oracle.record_success(Some(271_482)).await.unwrap();

        let metadata = MetadataStore::new(dir.path()).load().await.unwrap();
        assert_eq!(metadata.schema_version, METADATA_SCHEMA_VERSION);
        assert_eq!(metadata.last_record_count, Some(271_482));
        assert!(metadata.last_remote_modified.is_some());
    }

    #[tokio::test]
    async fn clear_removes_metadata_and_cached_files() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FakeProbe::new(None, None));
        let oracle = StalenessOracle::new(&test_config(dir.path()), probe);

        oracle.record_success(Some(10)).await.unwrap();
        tokio::fs::write(dir.path().join("bulk.ndjson"), b"{}").await.unwrap();

        oracle.clear().await.unwrap();

        assert!(!oracle.is_locally_fresh().await);
        assert!(!dir.path().join("bulk.ndjson").exists());
    }
}
