//! Bounded retry with capped exponential backoff

use crate::{PartOutcome, PartRequest, PartUploader, Result, UploadError};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often and how patiently a part is retried
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per part, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt cap and default delays
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the base delay and the cap
    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Delay before the next attempt, after `attempt` failures (1-based)
    ///
    /// `min(base * 2^(attempt-1), max)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// A part that went through, with the failures it took
#[derive(Clone, Debug)]
pub struct PartSuccess {
    /// Outcome of the successful attempt
    pub outcome: PartOutcome,
    /// Failed attempts before it
    pub retries: u32,
}

/// Wraps a [`PartUploader`] with retries
#[derive(Clone)]
pub struct RetryingPartUploader {
    inner: Arc<dyn PartUploader>,
    policy: RetryPolicy,
}

impl RetryingPartUploader {
    /// Create a retrying uploader
    pub fn new(inner: Arc<dyn PartUploader>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// Get the retry policy
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upload a part, retrying any failure up to the attempt cap
    ///
    /// Exhaustion yields [`UploadError::PartFailed`] wrapping the last error.
    /// Cancellation is returned as-is and never retried.
    pub async fn upload_with_retry(
        &self,
        part_number: u32,
        request: &PartRequest,
        cancel: &CancellationToken,
    ) -> Result<PartSuccess> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(UploadError::Cancelled),
                result = self.inner.upload(request) => result,
            };

            let err = match result {
                Ok(outcome) => {
                    if attempt > 1 {
                        debug!(part_number, attempt, "part succeeded after retry");
                    }
                    return Ok(PartSuccess {
                        outcome,
                        retries: attempt - 1,
                    });
                }
                Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
                Err(err) => err,
            };

            if attempt >= max_attempts {
                return Err(UploadError::PartFailed {
                    part_number,
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                part_number,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "part upload failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Replays scripted outcomes, then succeeds
    struct Scripted {
        script: Mutex<VecDeque<Result<PartOutcome>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn failing(times: usize) -> Arc<Self> {
            let script = (0..times)
                .map(|_| {
                    Err(UploadError::Http {
                        status: 500,
                        message: "boom".to_string(),
                    })
                })
                .collect();
            Arc::new(Self {
                script: Mutex::new(script),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl PartUploader for Scripted {
        async fn upload(&self, _request: &PartRequest) -> Result<PartOutcome> {
            *self.calls.lock() += 1;
            self.script.lock().pop_front().unwrap_or(Ok(PartOutcome {
                etag: Some("etag".to_string()),
                elapsed: Duration::from_millis(1),
            }))
        }
    }

    fn request() -> PartRequest {
        PartRequest {
            url: "memory://part".to_string(),
            body: Bytes::from_static(b"data"),
            content_type: "image/png".to_string(),
            content_range: None,
            timeout: Duration::from_secs(1),
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts).with_delays(Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy::default().with_delays(
            Duration::from_millis(1000),
            Duration::from_millis(3000),
        );
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(3000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_recovers_within_budget() {
        let inner = Scripted::failing(2);
        let uploader = RetryingPartUploader::new(inner.clone(), fast(3));

        let success = uploader
            .upload_with_retry(4, &request(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(success.retries, 2);
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_never_exceeds_attempt_cap() {
        let inner = Scripted::failing(10);
        let uploader = RetryingPartUploader::new(inner.clone(), fast(2));

        let err = uploader
            .upload_with_retry(4, &request(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(inner.calls(), 2);
        match err {
            UploadError::PartFailed { part_number, attempts, source } => {
                assert_eq!(part_number, 4);
                assert_eq!(attempts, 2);
                assert_eq!(source.status(), Some(500));
            }
            other => panic!("expected PartFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let inner = Scripted::failing(0);
        let uploader = RetryingPartUploader::new(inner, fast(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = uploader.upload_with_retry(1, &request(), &cancel).await.unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }
}
