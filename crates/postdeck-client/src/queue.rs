//! Concurrent part upload queue
//!
//! A self-refilling pool: a cursor walks the chunks in ascending order and a
//! new part starts as soon as any in-flight part settles. All part futures are
//! polled together on the calling task. The first part that exhausts its
//! retries fails the run; the remaining parts are cancelled and dropped, which
//! aborts their HTTP requests.

use crate::progress::{ProgressFn, ProgressTracker};
use crate::{
    ContentRange, PartOutcome, PartRequest, Result, RetryingPartUploader, UploadError,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use postdeck_core::{PartResult, UploadChunk, UploadSession};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Where a part goes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartDestination {
    /// Presigned URL
    pub url: String,
    /// Whether the part is written into one resumable object
    pub content_range: bool,
}

impl PartDestination {
    /// A destination that addresses one independent part
    pub fn part(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_range: false,
        }
    }
}

/// Resolves destinations and confirms uploaded parts for one session
#[async_trait]
pub trait PartTarget: Send + Sync {
    /// Destination for a chunk, fetched when its slot opens
    async fn destination(&self, chunk: &UploadChunk) -> Result<PartDestination>;

    /// Called once per uploaded part before it counts as done
    async fn confirm(&self, _chunk: &UploadChunk, _outcome: &PartOutcome) -> Result<()> {
        Ok(())
    }
}

/// What happened to one part
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartReport {
    pub part_number: u32,
    pub size: u64,
    pub retries: u32,
    pub etag: Option<String>,
    pub elapsed: Duration,
}

/// Summary of a finished queue run
#[derive(Clone, Debug)]
pub struct QueueReport {
    /// Wall time of the run
    pub total_time: Duration,
    /// Average throughput in bytes per second
    pub avg_speed: f64,
    /// Per-part results in ascending part order
    pub parts: Vec<PartReport>,
}

impl QueueReport {
    /// Failed attempts across all parts
    pub fn total_retries(&self) -> u32 {
        self.parts.iter().map(|p| p.retries).sum()
    }
}

/// Uploads the chunks of one session with bounded concurrency
#[derive(Clone)]
pub struct ConcurrentUploadQueue {
    uploader: RetryingPartUploader,
    max_concurrent: usize,
    part_timeout: Duration,
}

impl ConcurrentUploadQueue {
    /// Create a queue
    pub fn new(uploader: RetryingPartUploader, max_concurrent: usize, part_timeout: Duration) -> Self {
        Self {
            uploader,
            max_concurrent: max_concurrent.max(1),
            part_timeout,
        }
    }

    /// Get the concurrency limit
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Upload every chunk of `session` not yet marked uploaded
    ///
    /// Results are recorded on the session as parts finish. Progress is
    /// reported after each part.
    pub async fn run(
        &self,
        session: &mut UploadSession,
        data: &Bytes,
        content_type: &str,
        target: &dyn PartTarget,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<QueueReport> {
        if data.len() as u64 != session.total_bytes {
            return Err(UploadError::Config(format!(
                "{}: session expects {} bytes, got {}",
                session.file_name,
                session.total_bytes,
                data.len()
            )));
        }

        let pending: Vec<UploadChunk> = session.chunks.iter().filter(|c| !c.uploaded).cloned().collect();
        let mut tracker = ProgressTracker::new(session.total_bytes, session.total_parts());
        tracker.advance_to(session.uploaded_bytes());

        info!(
            file = %session.file_name,
            parts = pending.len(),
            max_concurrent = self.max_concurrent,
            "starting part uploads"
        );

        let abandon = cancel.child_token();
        let total_bytes = session.total_bytes;
        let mut reports = Vec::with_capacity(pending.len());
        let mut in_flight = FuturesUnordered::new();
        let mut cursor = 0;

        loop {
            while in_flight.len() < self.max_concurrent && cursor < pending.len() {
                let chunk = pending[cursor].clone();
                cursor += 1;
                in_flight.push(self.upload_chunk(chunk, data, total_bytes, content_type, target, &abandon));
            }

            let Some(result) = in_flight.next().await else {
                break;
            };

            match result {
                Ok(report) => {
                    session.record_part(
                        report.part_number,
                        report.retries,
                        PartResult {
                            etag: report.etag.clone(),
                            elapsed_ms: report.elapsed.as_millis() as u64,
                        },
                    )?;
                    let snapshot = tracker.record_part(report.size);
                    debug!(
                        part_number = report.part_number,
                        percent = snapshot.percent,
                        "part done"
                    );
                    if let Some(cb) = progress {
                        cb(snapshot);
                    }
                    reports.push(report);
                }
                Err(err) => {
                    abandon.cancel();
                    error!(
                        file = %session.file_name,
                        in_flight = in_flight.len(),
                        error = %err,
                        "part upload failed, abandoning remaining parts"
                    );
                    return Err(err);
                }
            }
        }

        reports.sort_by_key(|r| r.part_number);
        let report = QueueReport {
            total_time: tracker.elapsed(),
            avg_speed: tracker.average_speed(),
            parts: reports,
        };
        info!(
            file = %session.file_name,
            elapsed_ms = report.total_time.as_millis() as u64,
            bytes_per_sec = report.avg_speed as u64,
            retries = report.total_retries(),
            "part uploads finished"
        );
        Ok(report)
    }

    async fn upload_chunk(
        &self,
        chunk: UploadChunk,
        data: &Bytes,
        total_bytes: u64,
        content_type: &str,
        target: &dyn PartTarget,
        cancel: &CancellationToken,
    ) -> Result<PartReport> {
        let work = async {
            let destination = target
                .destination(&chunk)
                .await
                .map_err(|e| e.in_step(format!("part {} destination", chunk.part_number)))?;

            let request = PartRequest {
                url: destination.url,
                body: data.slice(chunk.byte_range()),
                content_type: content_type.to_string(),
                content_range: destination.content_range.then_some(ContentRange {
                    start: chunk.start,
                    end: chunk.end,
                    total: total_bytes,
                }),
                timeout: self.part_timeout,
            };

            let success = self
                .uploader
                .upload_with_retry(chunk.part_number, &request, cancel)
                .await?;

            target
                .confirm(&chunk, &success.outcome)
                .await
                .map_err(|e| e.in_step(format!("part {} confirmation", chunk.part_number)))?;

            Ok(PartReport {
                part_number: chunk.part_number,
                size: chunk.size(),
                retries: success.retries,
                etag: success.outcome.etag,
                elapsed: success.outcome.elapsed,
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            result = work => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PartUploader, RetryPolicy};
    use parking_lot::Mutex;
    use postdeck_core::ChunkSplitter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts overlap; fails parts listed in `fail_urls` every time
    #[derive(Default)]
    struct Probe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        fail_urls: Mutex<Vec<String>>,
        delay_ms: u64,
    }

    #[async_trait]
    impl PartUploader for Probe {
        async fn upload(&self, request: &PartRequest) -> Result<PartOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_urls.lock().contains(&request.url) {
                return Err(UploadError::Http {
                    status: 500,
                    message: "boom".to_string(),
                });
            }
            Ok(PartOutcome {
                etag: Some(format!("etag-{}", request.url)),
                elapsed: Duration::from_millis(self.delay_ms),
            })
        }
    }

    struct Urls;

    #[async_trait]
    impl PartTarget for Urls {
        async fn destination(&self, chunk: &UploadChunk) -> Result<PartDestination> {
            Ok(PartDestination::part(format!("part-{}", chunk.part_number)))
        }
    }

    fn queue(probe: Arc<Probe>, max_concurrent: usize, attempts: u32) -> ConcurrentUploadQueue {
        let policy = RetryPolicy::new(attempts).with_delays(Duration::from_millis(1), Duration::from_millis(1));
        ConcurrentUploadQueue::new(
            RetryingPartUploader::new(probe, policy),
            max_concurrent,
            Duration::from_secs(5),
        )
    }

    fn session(size: usize, chunk: u64) -> (UploadSession, Bytes) {
        let data = Bytes::from(vec![7u8; size]);
        let session = UploadSession::new("clip.mp4", size as u64, &ChunkSplitter::new(chunk).unwrap());
        (session, data)
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let probe = Arc::new(Probe {
            delay_ms: 10,
            ..Default::default()
        });
        let (mut session, data) = session(100, 5);

        let report = queue(probe.clone(), 3, 1)
            .run(&mut session, &data, "video/mp4", &Urls, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.parts.len(), 20);
        assert_eq!(probe.peak.load(Ordering::SeqCst), 3);
        assert!(session.chunks.iter().all(|c| c.uploaded));
        assert_eq!(session.ordered_parts().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_complete() {
        let probe = Arc::new(Probe {
            delay_ms: 1,
            ..Default::default()
        });
        let (mut session, data) = session(47, 5);
        let seen = Mutex::new(Vec::new());
        let cb = |p: crate::UploadProgress| seen.lock().push(p.percent);

        queue(probe, 4, 1)
            .run(&mut session, &data, "video/mp4", &Urls, Some(&cb), &CancellationToken::new())
            .await
            .unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 100.0);
    }

    #[tokio::test]
    async fn test_first_fatal_part_fails_the_run() {
        let probe = Arc::new(Probe {
            delay_ms: 1,
            ..Default::default()
        });
        probe.fail_urls.lock().push("part-3".to_string());
        let (mut session, data) = session(50, 5);

        let err = queue(probe.clone(), 2, 2)
            .run(&mut session, &data, "video/mp4", &Urls, None, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            UploadError::PartFailed { part_number, attempts, .. } => {
                assert_eq!(part_number, 3);
                assert_eq!(attempts, 2);
            }
            other => panic!("expected PartFailed, got {other:?}"),
        }
        assert!(!session.chunks[2].uploaded);
        assert!(session.ordered_parts().is_err());
        // the pool stops refilling once a part is fatal
        assert!(probe.calls.load(Ordering::SeqCst) < 10 + 1);
    }

    #[tokio::test]
    async fn test_resumes_only_pending_chunks() {
        let probe = Arc::new(Probe::default());
        let (mut session, data) = session(20, 5);
        session
            .record_part(
                1,
                0,
                PartResult {
                    etag: Some("x".to_string()),
                    elapsed_ms: 1,
                },
            )
            .unwrap();

        let report = queue(probe.clone(), 8, 1)
            .run(&mut session, &data, "video/mp4", &Urls, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.parts.len(), 3);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let probe = Arc::new(Probe {
            delay_ms: 50,
            ..Default::default()
        });
        let (mut session, data) = session(50, 5);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let err = queue(probe, 2, 1)
            .run(&mut session, &data, "video/mp4", &Urls, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled));
    }

    #[tokio::test]
    async fn test_size_mismatch_rejected() {
        let probe = Arc::new(Probe::default());
        let (mut session, _) = session(20, 5);
        let err = queue(probe, 2, 1)
            .run(&mut session, &Bytes::from_static(b"short"), "video/mp4", &Urls, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Config(_)));
    }
}
