//! Lightweight remote freshness probes
//!
//! The probe answers two cheap questions without downloading bulk data:
//! when was the remote feed last modified, and how many records does it
//! currently hold. Both are consumed by the staleness oracle.

use crate::config::{Config, FeedConfig};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum bytes read from the summary endpoint
///
/// The total-result-count field sits in the first lines of the response; the
/// rest of the paged payload is deliberately never parsed here.
const SUMMARY_READ_CAP: usize = 16 * 1024;

/// Lines of the summary response scanned for the count field
const SUMMARY_LINE_CAP: usize = 16;

/// Remote freshness signals, behind a trait so the oracle tests against fakes
#[async_trait]
pub trait TransportProbe: Send + Sync {
    /// Last-Modified of the remote feed, when the server exposes one
    async fn remote_modified(&self) -> Result<Option<DateTime<Utc>>>;

    /// Total record count from the summary endpoint
    async fn record_count(&self, api_key: Option<&str>) -> Result<u64>;
}

/// HTTP implementation of [`TransportProbe`] on reqwest
pub struct HttpProbe {
    client: reqwest::Client,
    feed: FeedConfig,
}

impl HttpProbe {
    /// Build a probe from the configured endpoints and timeouts
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.fetch.connect_timeout)
            .timeout(config.fetch.read_timeout)
            .build()?;
        Ok(Self {
            client,
            feed: config.feed.clone(),
        })
    }

    /// Extract the total-result-count field from the head of a summary response
    ///
    /// Scans only the first [`SUMMARY_LINE_CAP`] lines. Accepts both JSON
    /// (`"totalResults": 1234`) and key-value (`totalResults=1234`) shapes.
    fn parse_total_results(head: &str) -> Option<u64> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            // Field name first, then a JSON colon or plain equals, then the count
            #[allow(clippy::expect_used)]
            Regex::new(r#""?(?:totalResults|total_results)"?\s*[:=]\s*"?(\d+)"#)
                .expect("summary count pattern is valid")
        });

        for line in head.lines().take(SUMMARY_LINE_CAP) {
            if let Some(caps) = re.captures(line) {
                if let Ok(count) = caps[1].parse::<u64>() {
                    return Some(count);
                }
            }
        }
        None
    }
}

#[async_trait]
impl TransportProbe for HttpProbe {
    async fn remote_modified(&self) -> Result<Option<DateTime<Utc>>> {
        let response = self
            .client
            .head(self.feed.metadata_url.clone())
            .send()
            .await?
            .error_for_status()?;

        let Some(raw) = response.headers().get(reqwest::header::LAST_MODIFIED) else {
            tracing::debug!(url = %self.feed.metadata_url, "No Last-Modified header on metadata resource");
            return Ok(None);
        };

        let text = raw
            .to_str()
            .map_err(|e| Error::Other(format!("unreadable Last-Modified header: {e}")))?;
        let parsed = DateTime::parse_from_rfc2822(text)
            .map_err(|e| Error::Other(format!("unparseable Last-Modified '{text}': {e}")))?;

        Ok(Some(parsed.with_timezone(&Utc)))
    }

    async fn record_count(&self, api_key: Option<&str>) -> Result<u64> {
        let mut request = self.client.get(self.feed.summary_url.clone());
        if let Some(key) = api_key {
            request = request.header(self.feed.api_key_header.as_str(), key);
        }

        let mut response = request.send().await?.error_for_status()?;

        // Read only the head of the body; the count lives in the first lines
        let mut head = Vec::with_capacity(1024);
        while let Some(chunk) = response.chunk().await? {
            head.extend_from_slice(&chunk);
            if head.len() >= SUMMARY_READ_CAP {
                break;
            }
        }
        drop(response);

        let text = String::from_utf8_lossy(&head);
        Self::parse_total_results(&text).ok_or_else(|| {
            Error::Other(format!(
                "summary endpoint {} did not expose a total record count",
                self.feed.summary_url
            ))
        })
    }
}
