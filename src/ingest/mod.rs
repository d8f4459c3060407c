//! Resilient ingestion wrapper
//!
//! Applies downloaded feed payloads to the caller's store while isolating the
//! rest of the pipeline from individual malformed records. The wrapper runs
//! defensively: decoding is lenient, store batches are small so one bad page
//! has a small blast radius, and batch writes get a raised retry budget. When
//! the store still fails, the failure's cause chain is classified against the
//! known-defect signature table and a row-count heuristic decides whether the
//! already-populated store is acceptable as partial success.

pub mod signatures;

use crate::config::{IngestConfig, RetryConfig};
use crate::error::IngestError;
use crate::retry::retry_with_policy;
use crate::types::{Event, IngestionStats};
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;

use signatures::classify;

/// One decoded feed record
#[derive(Clone, Debug)]
pub struct FeedRecord {
    /// Record identifier, when the payload exposes one
    pub id: Option<String>,
    /// The record document itself
    pub document: Value,
}

/// The local store the feed is mirrored into
///
/// An external collaborator: the matching engine owns the real
/// implementation; tests use an in-memory one.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Apply one batch of records
    async fn apply_batch(&self, records: &[FeedRecord]) -> Result<(), IngestError>;

    /// Number of records currently in the store
    async fn record_count(&self) -> Result<u64, IngestError>;
}

/// Resilient wrapper around a [`FeedStore`]
pub struct ResilientIngestor {
    config: IngestConfig,
    batch_retry: RetryConfig,
    event_tx: broadcast::Sender<Event>,
}

impl ResilientIngestor {
    /// Build an ingestor with defensive settings derived from the config
    ///
    /// The store-batch retry budget comes from `ingest.max_retries`; delays
    /// are short since store failures that recover do so quickly.
    pub fn new(config: IngestConfig, event_tx: broadcast::Sender<Event>) -> Self {
        let batch_retry = RetryConfig {
            max_attempts: config.max_retries,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        };
        Self { config, batch_retry, event_tx }
    }

    /// Apply downloaded payload files to the store
    ///
    /// Streams newline-delimited JSON records. Malformed records are skipped
    /// and counted, never aborting the run. `processed + skipped` never
    /// exceeds the records actually read from the payload.
    ///
    /// # Errors
    ///
    /// Escalates only when neither the primary run nor the manual recovery
    /// path yields usable local data.
    pub async fn apply(
        &self,
        payloads: &[PathBuf],
        store: &dyn FeedStore,
    ) -> Result<IngestionStats, IngestError> {
        let estimated_total = estimate_record_count(payloads).await?;

        let mut stats = IngestionStats {
            processed: 0,
            skipped: 0,
            estimated_total,
        };
        self.event_tx
            .send(Event::IngestStarted { estimated_total })
            .ok();

        let run = self.run_payloads(payloads, store, &mut stats).await;

        match run {
            Ok(()) => {
                if stats.processed == 0 && stats.skipped == 0 {
                    let err = IngestError::EmptyPayload(describe_payloads(payloads));
                    self.event_tx
                        .send(Event::IngestFailed { error: err.to_string() })
                        .ok();
                    return Err(err);
                }
                self.event_tx
                    .send(Event::IngestComplete {
                        processed: stats.processed,
                        skipped: stats.skipped,
                        completion_rate: stats.completion_rate(),
                    })
                    .ok();
                tracing::info!(
                    processed = stats.processed,
                    skipped = stats.skipped,
                    completion_rate = ?stats.completion_rate(),
                    "Ingestion run complete"
                );
                Ok(stats)
            }
            Err(e) => self.attempt_recovery(e, stats, store).await,
        }
    }

    /// Stream every payload file through the store in small batches
    async fn run_payloads(
        &self,
        payloads: &[PathBuf],
        store: &dyn FeedStore,
        stats: &mut IngestionStats,
    ) -> Result<(), IngestError> {
        // Defensive page size: one bad page poisons fewer records
        let batch_size = self.config.resilient_batch_size.max(1);
        let mut batch: Vec<FeedRecord> = Vec::with_capacity(batch_size);

        for payload in payloads {
            let file = match tokio::fs::File::open(payload).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // A failed sibling download; ingest what did arrive
                    tracing::warn!(payload = %payload.display(), "Payload file missing, skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let mut lines = BufReader::new(file).lines();
            let mut line_no: u64 = 0;

            while let Some(line) = lines.next_line().await? {
                line_no += 1;
                if line.trim().is_empty() {
                    continue;
                }

                match decode_record(&line) {
                    Ok(record) => batch.push(record),
                    Err(reason) => {
                        if !self.config.lenient_decoding {
                            return Err(IngestError::Decode { line: line_no, reason });
                        }
                        stats.skipped += 1;
                        tracing::debug!(
                            payload = %payload.display(),
                            line = line_no,
                            reason = %reason,
                            "Skipped undecodable record"
                        );
                    }
                }

                if batch.len() >= batch_size {
                    self.flush_batch(store, &mut batch, stats).await?;
                }
            }
        }

        if !batch.is_empty() {
            self.flush_batch(store, &mut batch, stats).await?;
        }
        Ok(())
    }

    async fn flush_batch(
        &self,
        store: &dyn FeedStore,
        batch: &mut Vec<FeedRecord>,
        stats: &mut IngestionStats,
    ) -> Result<(), IngestError> {
        retry_with_policy(&self.batch_retry, || {
            let records = batch.as_slice();
            async move { store.apply_batch(records).await }
        })
        .await?;

        stats.processed += batch.len() as u64;
        batch.clear();

        self.event_tx
            .send(Event::IngestProgress {
                processed: stats.processed,
                skipped: stats.skipped,
            })
            .ok();
        Ok(())
    }

    /// Manual recovery for known upstream data defects
    ///
    /// Classifies the failure's cause chain; for a known defect, a row-count
    /// heuristic decides whether the store that already exists (from this run
    /// plus prior ones) is well populated enough to accept as partial
    /// success.
    async fn attempt_recovery(
        &self,
        error: IngestError,
        stats: IngestionStats,
        store: &dyn FeedStore,
    ) -> Result<IngestionStats, IngestError> {
        let chain = crate::error::cause_chain(&error);
        let category = classify(chain.iter().map(String::as_str));

        if !category.is_known_defect() {
            tracing::error!(error = %error, "Ingestion failed with no known defect signature");
            self.event_tx
                .send(Event::IngestFailed { error: error.to_string() })
                .ok();
            return Err(error);
        }

        tracing::warn!(
            category = %category,
            error = %error,
            "Known feed defect detected, checking existing store population"
        );

        let count = match store.record_count().await {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(error = %e, "Store count unavailable during recovery");
                self.event_tx
                    .send(Event::IngestFailed { error: error.to_string() })
                    .ok();
                return Err(IngestError::RecoveryFailed {
                    category: category.to_string(),
                    source: Box::new(error),
                });
            }
        };

        let well_populated = match stats.estimated_total {
            Some(total) if total > 0 => {
                count as f64 >= self.config.recovery_floor_ratio * total as f64
            }
            _ => count > 0,
        };

        if well_populated {
            tracing::warn!(
                store_records = count,
                estimated_total = ?stats.estimated_total,
                "Store is well populated; accepting run as partial success"
            );
            self.event_tx
                .send(Event::IngestComplete {
                    processed: stats.processed,
                    skipped: stats.skipped,
                    completion_rate: stats.completion_rate(),
                })
                .ok();
            Ok(stats)
        } else {
            tracing::error!(
                store_records = count,
                estimated_total = ?stats.estimated_total,
                "Store is not well populated; escalating ingestion failure"
            );
            self.event_tx
                .send(Event::IngestFailed { error: error.to_string() })
                .ok();
            Err(IngestError::RecoveryFailed {
                category: category.to_string(),
                source: Box::new(error),
            })
        }
    }
}

/// Decode one NDJSON line into a record
///
/// Any JSON object qualifies; the `id` field is extracted when present so
/// stores can upsert.
fn decode_record(line: &str) -> Result<FeedRecord, String> {
    let document: Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
    if !document.is_object() {
        return Err("record is not a JSON object".to_string());
    }
    let id = document
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    Ok(FeedRecord { id, document })
}

/// Count non-empty lines across the payload files
///
/// One cheap extra pass over local files; the estimate feeds the completion
/// rate and the recovery heuristic.
async fn estimate_record_count(payloads: &[PathBuf]) -> Result<Option<u64>, IngestError> {
    let mut total: u64 = 0;
    for payload in payloads {
        let file = match tokio::fs::File::open(payload).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let mut lines = BufReader::new(file).lines();
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                total += 1;
            }
        }
    }
    Ok((total > 0).then_some(total))
}

fn describe_payloads(payloads: &[PathBuf]) -> String {
    payloads
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
