//! HTTP transport for chunked feed downloads
//!
//! The engine talks to the network through the [`ChunkTransport`] trait so
//! its concurrency and retry behavior can be tested against a fake with no
//! real network. [`HttpTransport`] is the reqwest implementation used in
//! production.

use crate::config::Config;
use crate::error::FetchError;
use crate::types::RemoteFileInfo;
use async_trait::async_trait;
use std::ops::Range;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Network operations the fetch engine needs, one method per request shape
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Learn a remote file's size and whether it honors byte ranges
    async fn probe(&self, url: &Url, api_key: Option<&str>) -> Result<RemoteFileInfo, FetchError>;

    /// Fetch one byte range `[start, end)`; must return exactly the range
    async fn fetch_range(
        &self,
        url: &Url,
        range: Range<u64>,
        api_key: Option<&str>,
    ) -> Result<Vec<u8>, FetchError>;

    /// Stream the whole file to `dest` in a single request, returning the
    /// byte count written
    async fn fetch_full(
        &self,
        url: &Url,
        dest: &Path,
        api_key: Option<&str>,
    ) -> Result<u64, FetchError>;
}

/// reqwest-backed [`ChunkTransport`]
pub struct HttpTransport {
    client: reqwest::Client,
    api_key_header: String,
}

impl HttpTransport {
    /// Build a transport with the configured timeouts
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.fetch.connect_timeout)
            .timeout(config.fetch.read_timeout)
            .build()?;
        Ok(Self {
            client,
            api_key_header: config.feed.api_key_header.clone(),
        })
    }

    fn with_key(&self, request: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
        match api_key {
            Some(key) => request.header(self.api_key_header.as_str(), key),
            None => request,
        }
    }
}

#[async_trait]
impl ChunkTransport for HttpTransport {
    async fn probe(&self, url: &Url, api_key: Option<&str>) -> Result<RemoteFileInfo, FetchError> {
        let response = self
            .with_key(self.client.head(url.clone()), api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::UnexpectedStatus {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }

        let len = response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| FetchError::Probe {
                url: url.clone(),
                reason: "no Content-Length header".to_string(),
            })?;

        let accepts_ranges = response
            .headers()
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));

        Ok(RemoteFileInfo { len, accepts_ranges })
    }

    async fn fetch_range(
        &self,
        url: &Url,
        range: Range<u64>,
        api_key: Option<&str>,
    ) -> Result<Vec<u8>, FetchError> {
        // HTTP ranges are inclusive; ours are half-open
        let header_value = format!("bytes={}-{}", range.start, range.end - 1);
        let response = self
            .with_key(self.client.get(url.clone()), api_key)
            .header(reqwest::header::RANGE, header_value)
            .send()
            .await?;

        match response.status() {
            reqwest::StatusCode::PARTIAL_CONTENT => {}
            // A 200 means the server ignored the range and is sending the
            // whole file; treat as unsupported so the engine falls back
            reqwest::StatusCode::OK => {
                return Err(FetchError::RangeNotSupported { url: url.clone() });
            }
            status => {
                return Err(FetchError::UnexpectedStatus {
                    url: url.clone(),
                    status: status.as_u16(),
                });
            }
        }

        let body = response.bytes().await?;
        let expected = range.end - range.start;
        if body.len() as u64 != expected {
            return Err(FetchError::ShortRead {
                url: url.clone(),
                expected,
                actual: body.len() as u64,
            });
        }
        Ok(body.to_vec())
    }

    async fn fetch_full(
        &self,
        url: &Url,
        dest: &Path,
        api_key: Option<&str>,
    ) -> Result<u64, FetchError> {
        let mut response = self
            .with_key(self.client.get(url.clone()), api_key)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::UnexpectedStatus {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}
