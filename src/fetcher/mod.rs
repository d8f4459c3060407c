//! Parallel chunked fetch engine
//!
//! Downloads feed files through a bounded worker pool. Files that honor byte
//! ranges are partitioned into chunk tasks; each task streams its range to
//! the correct destination offset through its own file handle, so disjoint
//! ranges need no synchronization. A chunk that fails is retried on its own
//! budget; a chunk that exhausts the budget fails only its owning file, and
//! sibling files keep going.

mod partition;
pub mod transport;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use partition::partition;
pub use transport::{ChunkTransport, HttpTransport};

use crate::config::{FetchConfig, RetryConfig};
use crate::error::{Error, FetchError, Result};
use crate::retry::retry_with_policy;
use crate::types::{DownloadResult, DownloadTask, Event, FetchTarget, RemoteFileInfo, TaskStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Parallel download engine over a pluggable [`ChunkTransport`]
pub struct FetchEngine {
    fetch: FetchConfig,
    retry: RetryConfig,
    transport: Arc<dyn ChunkTransport>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

/// Everything one spawned file download needs, handed to its chunk tasks
struct FileFetchContext {
    target: FetchTarget,
    info: RemoteFileInfo,
    api_key: Option<String>,
    transport: Arc<dyn ChunkTransport>,
    fetch: FetchConfig,
    retry: RetryConfig,
    semaphore: Arc<Semaphore>,
    bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// Terminal outcome of one file within a batch
struct FileOutcome {
    url: Url,
    bytes_written: u64,
    error: Option<FetchError>,
}

impl FetchEngine {
    /// Build an engine over the given transport and event channel
    pub fn new(
        fetch: FetchConfig,
        retry: RetryConfig,
        transport: Arc<dyn ChunkTransport>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            fetch,
            retry,
            transport,
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Download every target file, tolerating per-file failures
    ///
    /// Files run concurrently through a shared worker pool of
    /// `max_concurrency` permits. The returned [`DownloadResult`] reports
    /// success only when every file completed; `total_bytes` counts bytes
    /// written by successfully completed chunks only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShuttingDown`] when called after `shutdown()`. Per-file
    /// failures do not error; they surface in the result's `error_message`.
    pub async fn fetch_all(
        &self,
        targets: &[FetchTarget],
        api_key: Option<&str>,
    ) -> Result<DownloadResult> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let started = Instant::now();

        // Probe phase: learn sizes and range support; a failed probe fails
        // only its own file
        let mut plans = Vec::with_capacity(targets.len());
        let mut first_error: Option<String> = None;
        for target in targets {
            match self.transport.probe(&target.url, api_key).await {
                Ok(info) => plans.push((target.clone(), info)),
                Err(e) => {
                    tracing::error!(url = %target.url, error = %e, "Probe failed, skipping file");
                    first_error.get_or_insert_with(|| e.to_string());
                    self.event_tx
                        .send(Event::FileFailed {
                            url: target.url.clone(),
                            error: e.to_string(),
                        })
                        .ok();
                }
            }
        }

        let total_expected = if plans.len() == targets.len() {
            Some(plans.iter().map(|(_, info)| info.len).sum())
        } else {
            None
        };
        self.event_tx
            .send(Event::FetchStarted {
                files: targets.len(),
                total_bytes: total_expected,
            })
            .ok();

        let bytes = Arc::new(AtomicU64::new(0));
        let semaphore = Arc::new(Semaphore::new(self.fetch.max_concurrency));

        let progress_token = self.cancel.child_token();
        let progress_task = self.fetch.enable_progress.then(|| {
            spawn_progress_reporter(
                self.fetch.progress_interval,
                total_expected,
                started,
                bytes.clone(),
                self.event_tx.clone(),
                progress_token.clone(),
            )
        });

        let mut set: JoinSet<FileOutcome> = JoinSet::new();
        for (target, info) in plans {
            let ctx = FileFetchContext {
                target,
                info,
                api_key: api_key.map(str::to_owned),
                transport: self.transport.clone(),
                fetch: self.fetch.clone(),
                retry: self.retry.clone(),
                semaphore: semaphore.clone(),
                bytes: bytes.clone(),
                cancel: self.cancel.clone(),
            };
            set.spawn(fetch_file(ctx));
        }

        let mut files_downloaded = 0;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => match outcome.error {
                    None => {
                        files_downloaded += 1;
                        self.event_tx
                            .send(Event::FileComplete {
                                url: outcome.url,
                                bytes: outcome.bytes_written,
                            })
                            .ok();
                    }
                    Some(e) => {
                        tracing::error!(url = %outcome.url, error = %e, "File download failed");
                        first_error.get_or_insert_with(|| e.to_string());
                        self.event_tx
                            .send(Event::FileFailed {
                                url: outcome.url,
                                error: e.to_string(),
                            })
                            .ok();
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "File download task panicked");
                    first_error.get_or_insert_with(|| format!("download task failed: {e}"));
                }
            }
        }

        progress_token.cancel();
        if let Some(task) = progress_task {
            task.await.ok();
        }

        let result = DownloadResult::from_measurements(
            targets.len(),
            files_downloaded,
            bytes.load(Ordering::Relaxed),
            started.elapsed(),
            first_error,
        );
        self.event_tx
            .send(Event::FetchComplete {
                success: result.success,
                files_downloaded: result.files_downloaded,
                total_bytes: result.total_bytes,
            })
            .ok();
        tracing::info!(
            success = result.success,
            files = result.files_downloaded,
            bytes = result.total_bytes,
            mbps = result.avg_throughput_mbps,
            "Fetch batch finished"
        );
        Ok(result)
    }

    /// Stop submitting new chunk tasks and interrupt in-flight ones
    ///
    /// Idempotent and callable mid-download; workers observe the token
    /// between retries and at permit acquisition.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Fetch engine shutting down");
            self.cancel.cancel();
        }
    }
}

/// Download one file, chunked when the server supports it
///
/// All bytes land in a `<dest>.part` staging file that replaces `dest` only
/// once the file is complete, so a refresh that fails mid-way leaves any
/// previously cached payload untouched.
async fn fetch_file(ctx: FileFetchContext) -> FileOutcome {
    let url = ctx.target.url.clone();
    let use_ranges = ctx.fetch.enable_range_requests
        && ctx.info.accepts_ranges
        && ctx.info.len > ctx.fetch.chunk_size_bytes;

    if let Some(parent) = ctx.target.dest.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            return FileOutcome { url, bytes_written: 0, error: Some(e.into()) };
        }
    }

    if !use_ranges {
        return fetch_single_stream(ctx).await;
    }

    let part = part_path(&ctx.target.dest);

    // Pre-size the staging file so every chunk lands at its final offset
    match tokio::fs::File::create(&part).await {
        Ok(file) => {
            if let Err(e) = file.set_len(ctx.info.len).await {
                return FileOutcome { url, bytes_written: 0, error: Some(e.into()) };
            }
        }
        Err(e) => return FileOutcome { url, bytes_written: 0, error: Some(e.into()) },
    }

    let tasks = partition(&url, ctx.info.len, ctx.fetch.chunk_size_bytes);
    tracing::debug!(url = %url, chunks = tasks.len(), len = ctx.info.len, "Partitioned file");

    let mut set: JoinSet<std::result::Result<u64, FetchError>> = JoinSet::new();
    for task in tasks {
        let transport = ctx.transport.clone();
        let retry = ctx.retry.clone();
        let semaphore = ctx.semaphore.clone();
        let bytes = ctx.bytes.clone();
        let cancel = ctx.cancel.clone();
        let api_key = ctx.api_key.clone();
        let dest = part.clone();
        set.spawn(async move {
            run_chunk_task(task, transport, retry, semaphore, bytes, cancel, api_key, dest).await
        });
    }

    let mut bytes_written = 0;
    let mut error: Option<FetchError> = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(n)) => bytes_written += n,
            Ok(Err(e)) => {
                error.get_or_insert(e);
            }
            Err(e) => {
                error.get_or_insert(FetchError::Io(std::io::Error::other(format!(
                    "chunk task failed: {e}"
                ))));
            }
        }
    }

    // A 200 answer to a ranged request means the Accept-Ranges header lied;
    // discard any partial chunks and take the single-stream path instead
    if matches!(error, Some(FetchError::RangeNotSupported { .. })) {
        tracing::warn!(url = %url, "Server ignored range requests, falling back to single stream");
        tokio::fs::remove_file(&part).await.ok();
        ctx.bytes.fetch_sub(bytes_written, Ordering::Relaxed);
        return fetch_single_stream(ctx).await;
    }

    if let Some(e) = error {
        tokio::fs::remove_file(&part).await.ok();
        return FileOutcome { url, bytes_written, error: Some(e) };
    }

    if let Err(e) = tokio::fs::rename(&part, &ctx.target.dest).await {
        return FileOutcome { url, bytes_written, error: Some(e.into()) };
    }
    FileOutcome { url, bytes_written, error: None }
}

/// Staging path for an in-flight download, `<dest>.part` beside the final file
fn part_path(dest: &Path) -> PathBuf {
    let mut staged = dest.as_os_str().to_owned();
    staged.push(".part");
    PathBuf::from(staged)
}

/// Single-request fallback for servers without range support and for files
/// that fit in one chunk
///
/// Streams into the same `<dest>.part` staging file as the chunked path and
/// renames only on success.
async fn fetch_single_stream(ctx: FileFetchContext) -> FileOutcome {
    let url = ctx.target.url.clone();
    let part = part_path(&ctx.target.dest);

    let permit = tokio::select! {
        permit = ctx.semaphore.acquire_owned() => permit,
        () = ctx.cancel.cancelled() => {
            return FileOutcome { url, bytes_written: 0, error: Some(FetchError::Canceled) };
        }
    };
    let Ok(_permit) = permit else {
        return FileOutcome { url, bytes_written: 0, error: Some(FetchError::Canceled) };
    };

    let result = retry_with_policy(&ctx.retry, || {
        let transport = ctx.transport.clone();
        let url = url.clone();
        let dest = part.clone();
        let api_key = ctx.api_key.clone();
        let cancel = ctx.cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return Err(FetchError::Canceled);
            }
            transport.fetch_full(&url, &dest, api_key.as_deref()).await
        }
    })
    .await;

    match result {
        Ok(written) => {
            if let Err(e) = tokio::fs::rename(&part, &ctx.target.dest).await {
                return FileOutcome { url, bytes_written: 0, error: Some(e.into()) };
            }
            ctx.bytes.fetch_add(written, Ordering::Relaxed);
            FileOutcome { url, bytes_written: written, error: None }
        }
        Err(e) => {
            tokio::fs::remove_file(&part).await.ok();
            FileOutcome { url, bytes_written: 0, error: Some(e) }
        }
    }
}

/// Fetch one chunk under the shared pool, retrying on its own budget, and
/// write it at its destination offset inside the staging file
#[allow(clippy::too_many_arguments)]
async fn run_chunk_task(
    mut task: DownloadTask,
    transport: Arc<dyn ChunkTransport>,
    retry: RetryConfig,
    semaphore: Arc<Semaphore>,
    bytes: Arc<AtomicU64>,
    cancel: CancellationToken,
    api_key: Option<String>,
    dest: PathBuf,
) -> std::result::Result<u64, FetchError> {
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => permit,
        () = cancel.cancelled() => return Err(FetchError::Canceled),
    };
    let _permit = permit.map_err(|_| FetchError::Canceled)?;

    task.status = TaskStatus::InFlight;
    let result = retry_with_policy(&retry, || {
        task.attempt += 1;
        let transport = transport.clone();
        let url = task.url.clone();
        let range = task.range.clone();
        let api_key = api_key.clone();
        let cancel = cancel.clone();
        async move {
            if cancel.is_cancelled() {
                return Err(FetchError::Canceled);
            }
            transport.fetch_range(&url, range, api_key.as_deref()).await
        }
    })
    .await;

    let body = match result {
        Ok(body) => body,
        Err(e) => {
            task.status = TaskStatus::Failed;
            tracing::debug!(
                url = %task.url,
                range = ?task.range,
                attempt = task.attempt,
                status = ?task.status,
                "Chunk task abandoned"
            );
            // Cancellation and an ignored range pass through for the file
            // level to handle; everything else exhausted its budget here
            return match e {
                e @ (FetchError::Canceled | FetchError::RangeNotSupported { .. }) => Err(e),
                e => Err(FetchError::ChunkExhausted {
                    url: task.url,
                    range: task.range,
                    attempts: task.attempt,
                    source: Box::new(e),
                }),
            };
        }
    };

    let mut file = tokio::fs::OpenOptions::new().write(true).open(&dest).await?;
    file.seek(std::io::SeekFrom::Start(task.offset)).await?;
    file.write_all(&body).await?;
    task.status = TaskStatus::Done;
    tracing::trace!(
        url = %task.url,
        range = ?task.range,
        attempt = task.attempt,
        status = ?task.status,
        "Chunk written"
    );

    let written = body.len() as u64;
    bytes.fetch_add(written, Ordering::Relaxed);
    Ok(written)
}

/// Spawn a background task that periodically emits throttled progress events
fn spawn_progress_reporter(
    interval: std::time::Duration,
    total_bytes: Option<u64>,
    started: Instant,
    bytes: Arc<AtomicU64>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let current = bytes.load(Ordering::Relaxed);
                    let percent = total_bytes.and_then(|total| {
                        (total > 0).then(|| (current as f32 / total as f32) * 100.0)
                    });
                    let elapsed = started.elapsed().as_secs_f64();
                    let speed_bps = if elapsed > 0.0 { (current as f64 / elapsed) as u64 } else { 0 };

                    event_tx
                        .send(Event::FetchProgress {
                            bytes: current,
                            total_bytes,
                            percent,
                            speed_bps,
                        })
                        .ok();
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}
