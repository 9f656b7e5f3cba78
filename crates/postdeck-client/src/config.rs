//! Client configuration

use crate::{MultipartStrategy, Result, RetryPolicy, UploadError};
use postdeck_core::{MULTIPART_CHUNK_SIZE, PRESIGNED_PART_CHUNK_SIZE};
use std::time::Duration;

/// Client configuration
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Record API endpoint URL
    pub api_endpoint: String,
    /// Storage API endpoint URL
    pub storage_endpoint: String,
    /// Access token (bearer)
    pub access_token: Option<String>,
    /// Request timeout for API calls
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "http://localhost:8787/api".to_string(),
            storage_endpoint: "http://localhost:8787/storage".to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("postdeck-client/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given endpoints
    pub fn new(api_endpoint: impl Into<String>, storage_endpoint: impl Into<String>) -> Self {
        Self {
            api_endpoint: api_endpoint.into(),
            storage_endpoint: storage_endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the access token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Tuning for one upload path
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadProfile {
    /// Bytes per part
    pub chunk_size: u64,
    /// Parts in flight at once
    pub max_concurrent: usize,
    /// Retry behaviour per part
    pub retry: RetryPolicy,
    /// Deadline per part request
    pub part_timeout: Duration,
}

impl UploadProfile {
    /// 5 MiB parts, 8 in flight, 60 s per part
    pub fn presigned_parts() -> Self {
        Self {
            chunk_size: PRESIGNED_PART_CHUNK_SIZE,
            max_concurrent: 8,
            retry: RetryPolicy::new(3)
                .with_delays(Duration::from_millis(1000), Duration::from_millis(5000)),
            part_timeout: Duration::from_secs(60),
        }
    }

    /// 40 MiB parts, 3 in flight, 120 s per part
    pub fn multipart() -> Self {
        Self {
            chunk_size: MULTIPART_CHUNK_SIZE,
            max_concurrent: 3,
            retry: RetryPolicy::new(3)
                .with_delays(Duration::from_millis(1000), Duration::from_millis(3000)),
            part_timeout: Duration::from_secs(120),
        }
    }

    /// Default profile for a strategy
    pub fn for_strategy(strategy: MultipartStrategy) -> Self {
        match strategy {
            MultipartStrategy::PresignedParts => Self::presigned_parts(),
            MultipartStrategy::Multipart => Self::multipart(),
        }
    }

    /// Set the chunk size
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the concurrency limit
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the per-part deadline
    pub fn with_part_timeout(mut self, part_timeout: Duration) -> Self {
        self.part_timeout = part_timeout;
        self
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(UploadError::Config("chunk size must be positive".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(UploadError::Config(
                "max concurrent uploads must be positive".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(UploadError::Config("max attempts must be positive".to_string()));
        }
        Ok(())
    }
}
