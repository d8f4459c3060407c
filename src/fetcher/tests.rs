//! Fetch engine tests against a fake transport (no real network)

use super::*;
use crate::config::{FetchConfig, RetryConfig};
use crate::types::{Event, FetchTarget};
use async_trait::async_trait;
use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::result::Result;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

struct FakeFile {
    content: Vec<u8>,
    accepts_ranges: bool,
}

/// Script entry for a failing range: how many times it fails and with what
enum Failure {
    Transient(u32),
    Permanent,
}

/// In-memory transport with programmable per-range failures
struct FakeTransport {
    files: HashMap<Url, FakeFile>,
    failures: Mutex<HashMap<(Url, u64), Failure>>,
    range_calls: AtomicU32,
    full_calls: AtomicU32,
    delay: Option<Duration>,
    reject_ranges: bool,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            files: HashMap::new(),
            failures: Mutex::new(HashMap::new()),
            range_calls: AtomicU32::new(0),
            full_calls: AtomicU32::new(0),
            delay: None,
            reject_ranges: false,
        }
    }

    /// Probe advertises ranges, but every ranged request answers as a server
    /// sending the whole file
    fn with_ranges_rejected(mut self) -> Self {
        self.reject_ranges = true;
        self
    }

    fn with_file(mut self, url: &Url, content: Vec<u8>, accepts_ranges: bool) -> Self {
        self.files.insert(url.clone(), FakeFile { content, accepts_ranges });
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn fail_range_transiently(self, url: &Url, start: u64, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((url.clone(), start), Failure::Transient(times));
        self
    }

    fn fail_range_permanently(self, url: &Url, start: u64) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((url.clone(), start), Failure::Permanent);
        self
    }

    fn file(&self, url: &Url) -> Result<&FakeFile, FetchError> {
        self.files.get(url).ok_or_else(|| FetchError::UnexpectedStatus {
            url: url.clone(),
            status: 404,
        })
    }
}

#[async_trait]
impl ChunkTransport for FakeTransport {
    async fn probe(&self, url: &Url, _api_key: Option<&str>) -> Result<RemoteFileInfo, FetchError> {
        let file = self.file(url)?;
        Ok(RemoteFileInfo {
            len: file.content.len() as u64,
            accepts_ranges: file.accepts_ranges,
        })
    }

    async fn fetch_range(
        &self,
        url: &Url,
        range: Range<u64>,
        _api_key: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        self.range_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_ranges {
            return Err(FetchError::RangeNotSupported { url: url.clone() });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(&(url.clone(), range.start)) {
                Some(Failure::Permanent) => {
                    return Err(FetchError::UnexpectedStatus { url: url.clone(), status: 404 });
                }
                Some(Failure::Transient(remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    return Err(FetchError::ShortRead {
                        url: url.clone(),
                        expected: range.end - range.start,
                        actual: 0,
                    });
                }
                _ => {}
            }
        }

        let file = self.file(url)?;
        Ok(file.content[range.start as usize..range.end as usize].to_vec())
    }

    async fn fetch_full(
        &self,
        url: &Url,
        dest: &Path,
        _api_key: Option<&str>,
    ) -> Result<u64, FetchError> {
        self.full_calls.fetch_add(1, Ordering::SeqCst);
        let file = self.file(url)?;
        tokio::fs::write(dest, &file.content).await?;
        Ok(file.content.len() as u64)
    }
}

fn pattern_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn test_url(name: &str) -> Url {
    Url::parse(&format!("https://feed.example.com/{name}")).unwrap()
}

fn fetch_config(chunk_size: u64) -> FetchConfig {
    FetchConfig {
        max_concurrency: 4,
        chunk_size_bytes: chunk_size,
        enable_progress: false,
        progress_interval: Duration::from_millis(10),
        ..FetchConfig::default()
    }
}

fn retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

fn engine(fetch: FetchConfig, transport: FakeTransport) -> (FetchEngine, broadcast::Receiver<Event>) {
    let (event_tx, event_rx) = broadcast::channel(256);
    let engine = FetchEngine::new(fetch, retry_config(), Arc::new(transport), event_tx);
    (engine, event_rx)
}

fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn chunked_download_reassembles_divisible_file() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(10_000);
    let transport = FakeTransport::new().with_file(&url, content.clone(), true);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bulk.ndjson");
    let result = engine
        .fetch_all(&[FetchTarget { url, dest: dest.clone() }], None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.files_downloaded, 1);
    assert_eq!(result.total_bytes, 10_000);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
}

#[tokio::test]
async fn chunked_download_reassembles_non_divisible_file() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(10_001);
    let transport = FakeTransport::new().with_file(&url, content.clone(), true);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bulk.ndjson");
    let result = engine
        .fetch_all(&[FetchTarget { url, dest: dest.clone() }], None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.total_bytes, 10_001);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
}

#[tokio::test]
async fn twenty_mib_file_in_ten_two_mib_chunks() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(20 * 1024 * 1024);
    let transport = FakeTransport::new().with_file(&url, content.clone(), true);
    let (engine, _rx) = engine(fetch_config(2 * 1024 * 1024), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bulk.ndjson");
    let result = engine
        .fetch_all(&[FetchTarget { url, dest: dest.clone() }], None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.files_downloaded, 1);
    assert_eq!(result.total_bytes, 20_971_520);
    assert_eq!(tokio::fs::read(&dest).await.unwrap().len(), content.len());
}

#[tokio::test]
async fn transient_chunk_failures_recover_within_budget() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(10_000);
    let transport = FakeTransport::new()
        .with_file(&url, content.clone(), true)
        .fail_range_transiently(&url, 2_500, 2);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bulk.ndjson");
    let result = engine
        .fetch_all(&[FetchTarget { url, dest: dest.clone() }], None)
        .await
        .unwrap();

    assert!(result.success, "two transient failures fit a budget of three retries");
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
}

#[tokio::test]
async fn permanent_chunk_failure_fails_only_its_file() {
    let url_a = test_url("a.ndjson");
    let url_b = test_url("b.ndjson");
    let content_a = pattern_bytes(10_000);
    let content_b = pattern_bytes(7_500);
    let transport = FakeTransport::new()
        .with_file(&url_a, content_a, true)
        .with_file(&url_b, content_b.clone(), true)
        .fail_range_permanently(&url_a, 5_000);
    let (engine, mut rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest_a = dir.path().join("a.ndjson");
    let dest_b = dir.path().join("b.ndjson");
    let result = engine
        .fetch_all(
            &[
                FetchTarget { url: url_a.clone(), dest: dest_a },
                FetchTarget { url: url_b.clone(), dest: dest_b.clone() },
            ],
            None,
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.files_downloaded, 1, "sibling file still completes");
    assert!(result.error_message.is_some());
    assert_eq!(tokio::fs::read(&dest_b).await.unwrap(), content_b);

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(e, Event::FileFailed { url, .. } if *url == url_a)));
    assert!(events.iter().any(|e| matches!(e, Event::FileComplete { url, .. } if *url == url_b)));
}

#[tokio::test]
async fn failed_file_still_counts_its_completed_chunks() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(10_000);
    let transport = FakeTransport::new()
        .with_file(&url, content, true)
        .fail_range_permanently(&url, 0);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let result = engine
        .fetch_all(
            &[FetchTarget { url, dest: dir.path().join("bulk.ndjson") }],
            None,
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.files_downloaded, 0);
    assert_eq!(result.total_bytes, 7_500, "three of four chunks completed");
}

#[tokio::test]
async fn failed_refresh_preserves_previous_payload() {
    let url = test_url("bulk.ndjson");
    let transport = FakeTransport::new()
        .with_file(&url, pattern_bytes(10_000), true)
        .fail_range_permanently(&url, 5_000);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bulk.ndjson");
    let previous = b"previously cached good payload".to_vec();
    tokio::fs::write(&dest, &previous).await.unwrap();

    let result = engine
        .fetch_all(&[FetchTarget { url, dest: dest.clone() }], None)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(
        tokio::fs::read(&dest).await.unwrap(),
        previous,
        "a failed refresh must leave the cached payload untouched"
    );
    let mut staged = dest.into_os_string();
    staged.push(".part");
    assert!(
        !std::path::PathBuf::from(staged).exists(),
        "no staging leftovers after failure"
    );
}

#[tokio::test]
async fn server_that_ignores_ranges_falls_back_to_single_stream() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(10_000);
    let transport = FakeTransport::new()
        .with_file(&url, content.clone(), true)
        .with_ranges_rejected();
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bulk.ndjson");
    let result = engine
        .fetch_all(&[FetchTarget { url, dest: dest.clone() }], None)
        .await
        .unwrap();

    assert!(result.success, "a lying Accept-Ranges header must not fail the file");
    assert_eq!(result.total_bytes, 10_000);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
}

#[tokio::test]
async fn exhausted_chunk_reports_its_attempt_count() {
    let url = test_url("bulk.ndjson");
    let transport = FakeTransport::new()
        .with_file(&url, pattern_bytes(10_000), true)
        .fail_range_transiently(&url, 2_500, 10);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let result = engine
        .fetch_all(
            &[FetchTarget { url, dest: dir.path().join("bulk.ndjson") }],
            None,
        )
        .await
        .unwrap();

    assert!(!result.success);
    // A budget of three retries: the first try plus three more
    assert!(result.error_message.unwrap().contains("after 4 attempts"));
}

#[tokio::test]
async fn falls_back_to_single_stream_without_range_support() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(10_000);
    let transport = FakeTransport::new().with_file(&url, content.clone(), false);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("bulk.ndjson");
    let result = engine
        .fetch_all(&[FetchTarget { url, dest: dest.clone() }], None)
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.total_bytes, 10_000);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), content);
}

#[tokio::test]
async fn file_smaller_than_one_chunk_uses_single_stream() {
    let url = test_url("small.ndjson");
    let content = pattern_bytes(100);
    let transport = FakeTransport::new().with_file(&url, content, true);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let result = engine
        .fetch_all(
            &[FetchTarget { url, dest: dir.path().join("small.ndjson") }],
            None,
        )
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.total_bytes, 100);
}

#[tokio::test]
async fn probe_failure_fails_only_that_file() {
    let url_known = test_url("known.ndjson");
    let url_unknown = test_url("missing.ndjson");
    let content = pattern_bytes(5_000);
    let transport = FakeTransport::new().with_file(&url_known, content, true);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    let dir = tempfile::tempdir().unwrap();
    let result = engine
        .fetch_all(
            &[
                FetchTarget { url: url_unknown, dest: dir.path().join("missing.ndjson") },
                FetchTarget { url: url_known, dest: dir.path().join("known.ndjson") },
            ],
            None,
        )
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.files_downloaded, 1);
    assert!(result.error_message.unwrap().contains("404"));
}

#[tokio::test]
async fn shutdown_refuses_new_batches_and_is_idempotent() {
    let url = test_url("bulk.ndjson");
    let transport = FakeTransport::new().with_file(&url, pattern_bytes(100), true);
    let (engine, _rx) = engine(fetch_config(2_500), transport);

    engine.shutdown();
    engine.shutdown();

    let dir = tempfile::tempdir().unwrap();
    let err = engine
        .fetch_all(&[FetchTarget { url, dest: dir.path().join("x") }], None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
}

#[tokio::test]
async fn progress_events_are_emitted_while_downloading() {
    let url = test_url("bulk.ndjson");
    let content = pattern_bytes(50_000);
    let transport = FakeTransport::new()
        .with_file(&url, content, true)
        .with_delay(Duration::from_millis(20));
    let mut config = fetch_config(5_000);
    config.enable_progress = true;
    config.progress_interval = Duration::from_millis(5);
    let (engine, mut rx) = engine(config, transport);

    let dir = tempfile::tempdir().unwrap();
    let result = engine
        .fetch_all(
            &[FetchTarget { url, dest: dir.path().join("bulk.ndjson") }],
            None,
        )
        .await
        .unwrap();
    assert!(result.success);

    let events = drain_events(&mut rx);
    let progress: Vec<_> = events
        .iter()
        .filter(|e| matches!(e, Event::FetchProgress { .. }))
        .collect();
    assert!(!progress.is_empty(), "expected at least one throttled progress event");
}
