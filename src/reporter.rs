//! Progress and telemetry reporting
//!
//! Long-running syncs report progress through a [`ProgressObserver`] so the
//! pipeline never owns a terminal or a log backend. Two implementations ship
//! with the crate: [`ConsoleReporter`] renders a throttled single-line bar for
//! interactive use, [`TracingReporter`] forwards everything to `tracing` for
//! services. [`spawn_event_pump`] bridges the broadcast event stream to an
//! observer.

use crate::types::{Event, IngestionStats};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Observer for synchronization progress and status messages
///
/// All methods take `&self` and must be cheap: they are called from hot
/// download paths. Implementations throttle their own output.
pub trait ProgressObserver: Send + Sync {
    /// A measured phase started, with the expected total when known
    fn on_start(&self, total: Option<u64>);

    /// Progress within the current phase
    fn on_progress(&self, current: u64, total: Option<u64>, label: &str);

    /// The run finished with the given counters
    fn on_complete(&self, stats: &IngestionStats);

    /// The run failed
    fn on_failed(&self, message: &str, cause: Option<&str>);

    /// Informational status line
    fn info(&self, message: &str);

    /// Warning status line
    fn warn(&self, message: &str);

    /// Error status line
    fn error(&self, message: &str);
}

/// Interactive single-line progress bar for terminals
///
/// Renders at most once per `min_render_interval` regardless of how often
/// progress arrives; stale frames are simply dropped.
pub struct ConsoleReporter {
    min_render_interval: Duration,
    // Millis since `started` of the last rendered frame
    last_render_ms: AtomicU64,
    started: Instant,
}

impl ConsoleReporter {
    /// Reporter with the default 100 ms render throttle
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(100))
    }

    /// Reporter with a custom render throttle
    pub fn with_interval(min_render_interval: Duration) -> Self {
        Self {
            min_render_interval,
            last_render_ms: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    /// True when enough time has passed to render another frame
    ///
    /// A lost race here costs one dropped frame, never a stuck bar.
    fn should_render(&self) -> bool {
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_render_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.min_render_interval.as_millis() as u64 && last != 0 {
            return false;
        }
        self.last_render_ms.store(now_ms.max(1), Ordering::Relaxed);
        true
    }

    fn eta(&self, current: u64, total: u64) -> Option<Duration> {
        if current == 0 || total <= current {
            return None;
        }
        let elapsed = self.started.elapsed().as_secs_f64();
        let rate = current as f64 / elapsed;
        if rate <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64((total - current) as f64 / rate))
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for ConsoleReporter {
    fn on_start(&self, total: Option<u64>) {
        match total {
            Some(total) => println!("Starting, {} expected", format_count(total)),
            None => println!("Starting"),
        }
    }

    fn on_progress(&self, current: u64, total: Option<u64>, label: &str) {
        if !self.should_render() {
            return;
        }
        match total {
            Some(total) if total > 0 => {
                let percent = current as f64 / total as f64 * 100.0;
                let eta = self
                    .eta(current, total)
                    .map(|d| format!(", ETA {}", format_duration(d)))
                    .unwrap_or_default();
                print!(
                    "\r{label}: {}/{} ({percent:.1}%){eta}    ",
                    format_count(current),
                    format_count(total),
                );
            }
            _ => print!("\r{label}: {}    ", format_count(current)),
        }
        use std::io::Write;
        std::io::stdout().flush().ok();
    }

    fn on_complete(&self, stats: &IngestionStats) {
        let rate = stats
            .completion_rate()
            .map(|r| format!(" ({r:.1}% of estimate)"))
            .unwrap_or_default();
        println!(
            "\nDone: {} records applied, {} skipped{rate}",
            stats.processed, stats.skipped
        );
    }

    fn on_failed(&self, message: &str, cause: Option<&str>) {
        match cause {
            Some(cause) => eprintln!("\nFailed: {message} ({cause})"),
            None => eprintln!("\nFailed: {message}"),
        }
    }

    fn info(&self, message: &str) {
        println!("{message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("warning: {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("error: {message}");
    }
}

/// Observer that forwards everything to `tracing`
///
/// For services that already own a subscriber; progress lines become
/// structured events instead of terminal output.
#[derive(Default)]
pub struct TracingReporter;

impl TracingReporter {
    /// New tracing-backed reporter
    pub fn new() -> Self {
        Self
    }
}

impl ProgressObserver for TracingReporter {
    fn on_start(&self, total: Option<u64>) {
        tracing::info!(total = ?total, "Phase started");
    }

    fn on_progress(&self, current: u64, total: Option<u64>, label: &str) {
        tracing::debug!(current, total = ?total, label, "Progress");
    }

    fn on_complete(&self, stats: &IngestionStats) {
        tracing::info!(
            processed = stats.processed,
            skipped = stats.skipped,
            completion_rate = ?stats.completion_rate(),
            "Run complete"
        );
    }

    fn on_failed(&self, message: &str, cause: Option<&str>) {
        tracing::error!(reason = message, cause = ?cause, "Run failed");
    }

    fn info(&self, message: &str) {
        tracing::info!("{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// Bridge a broadcast event stream to an observer
///
/// Runs until the channel closes. A lagged receiver skips the dropped events
/// and keeps going; progress reporting tolerates gaps.
pub fn spawn_event_pump(
    mut events: broadcast::Receiver<Event>,
    observer: Arc<dyn ProgressObserver>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Observer lagged behind event stream");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            dispatch(&event, observer.as_ref());
        }
    })
}

fn dispatch(event: &Event, observer: &dyn ProgressObserver) {
    match event {
        Event::SyncStarted => observer.info("Synchronization started"),
        Event::CacheHit { reason } => {
            observer.info(&format!("Local mirror is fresh ({reason})"));
        }
        Event::RefreshNeeded { reason } => {
            observer.info(&format!("Refreshing mirror ({reason})"));
        }
        Event::FetchStarted { files, total_bytes } => {
            observer.info(&format!("Downloading {files} file(s)"));
            observer.on_start(*total_bytes);
        }
        Event::FetchProgress {
            bytes, total_bytes, ..
        } => observer.on_progress(*bytes, *total_bytes, "Downloaded"),
        Event::FileComplete { url, bytes } => {
            observer.info(&format!("Completed {url} ({} bytes)", bytes));
        }
        Event::FileFailed { url, error } => {
            observer.warn(&format!("File {url} failed: {error}"));
        }
        Event::FetchComplete {
            success,
            files_downloaded,
            total_bytes,
        } => {
            if *success {
                observer.info(&format!(
                    "Download complete: {files_downloaded} file(s), {total_bytes} bytes"
                ));
            } else {
                observer.warn(&format!(
                    "Download finished with failures: {files_downloaded} file(s) succeeded"
                ));
            }
        }
        Event::IngestStarted { estimated_total } => observer.on_start(*estimated_total),
        Event::IngestProgress { processed, skipped } => {
            observer.on_progress(*processed + *skipped, None, "Ingested");
        }
        Event::IngestComplete {
            processed,
            skipped,
            completion_rate: _,
        } => {
            observer.on_complete(&IngestionStats {
                processed: *processed,
                skipped: *skipped,
                estimated_total: None,
            });
        }
        Event::IngestFailed { error } => observer.on_failed("ingestion failed", Some(error)),
        Event::Shutdown => observer.info("Shutting down"),
    }
}

fn format_count(n: u64) -> String {
    if n >= 10_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 10_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
