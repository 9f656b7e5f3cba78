//! Single-part uploads to presigned URLs

use crate::{ClientConfig, Result, UploadError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{header, Client};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// `Content-Range` of a part written into a single resumable object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte (inclusive)
    pub start: u64,
    /// Last byte (exclusive)
    pub end: u64,
    /// Size of the whole object
    pub total: u64,
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end.saturating_sub(1), self.total)
    }
}

/// One PUT of a chunk body
#[derive(Clone, Debug)]
pub struct PartRequest {
    /// Presigned destination
    pub url: String,
    /// Chunk bytes
    pub body: Bytes,
    /// MIME type of the whole file
    pub content_type: String,
    /// Set only when parts land in one resumable object
    pub content_range: Option<ContentRange>,
    /// Deadline for this request
    pub timeout: Duration,
}

/// Result of a successful part upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartOutcome {
    /// Backend-issued ETag, quotes stripped
    pub etag: Option<String>,
    /// Time the request took
    pub elapsed: Duration,
}

/// Uploads one chunk and classifies the outcome
#[async_trait]
pub trait PartUploader: Send + Sync {
    /// PUT the chunk; fails with `Network`, `Timeout` or `Http`
    async fn upload(&self, request: &PartRequest) -> Result<PartOutcome>;
}

/// Part uploader over HTTP
#[derive(Clone)]
pub struct HttpPartUploader {
    http: Client,
}

impl HttpPartUploader {
    /// Create an uploader sharing the client's user agent
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| UploadError::Config(e.to_string()))?;
        Ok(Self { http })
    }

    /// Wrap an existing HTTP client
    pub fn with_client(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PartUploader for HttpPartUploader {
    #[instrument(skip(self, request), fields(bytes = request.body.len()))]
    async fn upload(&self, request: &PartRequest) -> Result<PartOutcome> {
        let started = Instant::now();

        let mut req = self
            .http
            .put(&request.url)
            .header(header::CONTENT_TYPE, &request.content_type);
        if let Some(range) = request.content_range {
            req = req.header(header::CONTENT_RANGE, range.to_string());
        }
        // Content-Length follows from the sized body
        let req = req.body(request.body.clone());

        let response = match tokio::time::timeout(request.timeout, req.send()).await {
            Ok(sent) => sent?,
            Err(_) => {
                return Err(UploadError::Timeout(format!(
                    "part exceeded {}s deadline",
                    request.timeout.as_secs()
                )))
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UploadError::Http {
                status: status.as_u16(),
                message: if text.is_empty() {
                    status.to_string()
                } else {
                    text
                },
            });
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_matches('"').to_string());

        let elapsed = started.elapsed();
        debug!(?etag, elapsed_ms = elapsed.as_millis() as u64, "part uploaded");
        Ok(PartOutcome { etag, elapsed })
    }
}
