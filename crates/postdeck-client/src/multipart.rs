//! Single-file uploads: direct, presigned parts, and true multipart
//!
//! Files that fit in one chunk go up with one presigned PUT. Larger files use
//! the configured [`MultipartStrategy`]:
//!
//! - `PresignedParts`: every chunk becomes its own `name.partN` object, then
//!   the store composes them into `name`. Part objects already written are
//!   deleted if a part or the compose step fails.
//! - `Multipart`: initiate, upload parts to lazily fetched URLs, register each
//!   ETag, complete. Any failure after initiation aborts the upload.

use crate::progress::ProgressFn;
use crate::queue::{ConcurrentUploadQueue, PartDestination, PartTarget};
use crate::{
    ObjectStore, PartOutcome, PartUploader, Result, RetryingPartUploader, UploadError, UploadProfile,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use postdeck_core::{
    part_object_name, ChunkSplitter, CoreError, MediaBlob, MultipartState, UploadChunk, UploadSession,
};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Protocol used for files larger than one chunk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MultipartStrategy {
    /// Independent part objects joined by a compose call
    PresignedParts,
    /// Initiate / register / complete session
    #[default]
    Multipart,
}

impl MultipartStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PresignedParts => "presigned-parts",
            Self::Multipart => "multipart",
        }
    }
}

impl fmt::Display for MultipartStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MultipartStrategy {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "presigned-parts" | "presigned_parts" | "parts" => Ok(Self::PresignedParts),
            "multipart" => Ok(Self::Multipart),
            other => Err(UploadError::Config(format!("unknown upload strategy: {other}"))),
        }
    }
}

/// A stored object
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedObject {
    /// Object key
    pub path: String,
    /// URL the object is served from
    pub public_url: String,
    /// Size in bytes
    pub size: u64,
    /// Parts it was sent in
    pub parts: u32,
    /// Failed part attempts along the way
    pub retries: u32,
    /// Wall time of the upload
    pub elapsed: Duration,
}

/// Uploads one media blob to one object key
#[derive(Clone)]
pub struct FileUploader {
    store: Arc<dyn ObjectStore>,
    queue: ConcurrentUploadQueue,
    splitter: ChunkSplitter,
    strategy: MultipartStrategy,
}

impl FileUploader {
    /// Create an uploader
    pub fn new(
        store: Arc<dyn ObjectStore>,
        uploader: Arc<dyn PartUploader>,
        profile: &UploadProfile,
        strategy: MultipartStrategy,
    ) -> Result<Self> {
        profile.validate()?;
        let splitter = ChunkSplitter::new(profile.chunk_size)?;
        let queue = ConcurrentUploadQueue::new(
            RetryingPartUploader::new(uploader, profile.retry),
            profile.max_concurrent,
            profile.part_timeout,
        );
        Ok(Self {
            store,
            queue,
            splitter,
            strategy,
        })
    }

    /// Get the strategy
    pub fn strategy(&self) -> MultipartStrategy {
        self.strategy
    }

    /// Number of parts a file of `size` bytes is sent in
    pub fn parts_for(&self, size: u64) -> usize {
        postdeck_core::calculate_chunk_count(size, self.splitter.chunk_size())
    }

    /// Upload `blob` to `path`
    #[instrument(skip(self, blob, progress, cancel), fields(strategy = %self.strategy, size = blob.size()))]
    pub async fn upload(
        &self,
        path: &str,
        blob: &MediaBlob,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<UploadedObject> {
        blob.validate()?;
        let started = Instant::now();
        let mut session = UploadSession::new(path, blob.size(), &self.splitter);

        let public_url = if session.total_parts() <= 1 {
            self.upload_direct(&mut session, blob, progress, cancel).await?
        } else {
            match self.strategy {
                MultipartStrategy::PresignedParts => {
                    self.upload_presigned_parts(&mut session, blob, progress, cancel)
                        .await?
                }
                MultipartStrategy::Multipart => {
                    self.upload_multipart(&mut session, blob, progress, cancel).await?
                }
            }
        };

        let object = UploadedObject {
            path: path.to_string(),
            public_url,
            size: blob.size(),
            parts: session.total_parts(),
            retries: session.chunks.iter().map(|c| c.retries).sum(),
            elapsed: started.elapsed(),
        };
        info!(
            path,
            parts = object.parts,
            retries = object.retries,
            elapsed_ms = object.elapsed.as_millis() as u64,
            "object uploaded"
        );
        Ok(object)
    }

    async fn upload_direct(
        &self,
        session: &mut UploadSession,
        blob: &MediaBlob,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let presigned = self
            .store
            .generate_upload_url(&session.file_name, &blob.mime_type, blob.size())
            .await?;
        let target = FixedTarget(presigned.upload_url);
        self.queue
            .run(session, &blob.data, &blob.mime_type, &target, progress, cancel)
            .await?;
        Ok(presigned.public_url)
    }

    async fn upload_presigned_parts(
        &self,
        session: &mut UploadSession,
        blob: &MediaBlob,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let path = session.file_name.clone();
        let target = PartObjectTarget {
            store: self.store.as_ref(),
            path: &path,
            mime_type: &blob.mime_type,
            written: Mutex::new(BTreeSet::new()),
        };

        let result = async {
            self.queue
                .run(&mut *session, &blob.data, &blob.mime_type, &target, progress, cancel)
                .await?;
            session.ordered_parts()?;
            let parts: Vec<String> = (1..=session.total_parts())
                .map(|n| part_object_name(&path, n))
                .collect();
            debug!(path = %path, parts = parts.len(), "composing part objects");
            self.store.compose_parts(&path, &parts, &blob.mime_type).await
        }
        .await;

        if result.is_err() {
            let written: Vec<String> = target
                .written
                .lock()
                .iter()
                .map(|n| part_object_name(&path, *n))
                .collect();
            if !written.is_empty() {
                if let Err(cleanup) = self.store.delete_files(&written).await {
                    warn!(path = %path, parts = written.len(), error = %cleanup, "part cleanup failed");
                }
            }
        }
        result
    }

    async fn upload_multipart(
        &self,
        session: &mut UploadSession,
        blob: &MediaBlob,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut state = MultipartState::NotStarted;
        let upload_id = self
            .store
            .initiate_multipart_upload(&session.file_name, &blob.mime_type, blob.size())
            .await?;
        state.initiated(upload_id.clone())?;
        session.upload_id = Some(upload_id.clone());
        debug!(upload_id = %upload_id, parts = session.total_parts(), "multipart upload initiated");

        let result = self
            .drive_multipart(&mut state, &upload_id, session, blob, progress, cancel)
            .await;

        if let Err(err) = &result {
            if state.needs_abort() {
                warn!(upload_id = %upload_id, state = state.name(), error = %err, "aborting multipart upload");
                match self.store.abort_multipart_upload(&upload_id).await {
                    Ok(()) => state.aborted()?,
                    Err(abort) => warn!(upload_id = %upload_id, error = %abort, "abort failed"),
                }
            }
        }
        result
    }

    async fn drive_multipart(
        &self,
        state: &mut MultipartState,
        upload_id: &str,
        session: &mut UploadSession,
        blob: &MediaBlob,
        progress: Option<ProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String> {
        state.uploading()?;
        let target = MultipartTarget {
            store: self.store.as_ref(),
            upload_id,
            registered: Mutex::new(BTreeSet::new()),
        };
        self.queue
            .run(session, &blob.data, &blob.mime_type, &target, progress, cancel)
            .await?;

        let registered = target.registered.into_inner();
        let missing: Vec<u32> = session
            .chunks
            .iter()
            .map(|c| c.part_number)
            .filter(|n| !registered.contains(n))
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::MissingParts { missing }.into());
        }
        session.ordered_parts()?;
        state.registered()?;

        let public_url = self.store.complete_multipart_upload(upload_id).await?;
        state.completed(public_url.clone())?;
        Ok(public_url)
    }
}

/// Every chunk goes to the same presigned URL
struct FixedTarget(String);

#[async_trait]
impl PartTarget for FixedTarget {
    async fn destination(&self, _chunk: &UploadChunk) -> Result<PartDestination> {
        Ok(PartDestination::part(self.0.clone()))
    }
}

/// Each chunk becomes a `name.partN` object
struct PartObjectTarget<'a> {
    store: &'a dyn ObjectStore,
    path: &'a str,
    mime_type: &'a str,
    written: Mutex<BTreeSet<u32>>,
}

#[async_trait]
impl PartTarget for PartObjectTarget<'_> {
    async fn destination(&self, chunk: &UploadChunk) -> Result<PartDestination> {
        let name = part_object_name(self.path, chunk.part_number);
        let presigned = self
            .store
            .generate_upload_url(&name, self.mime_type, chunk.size())
            .await?;
        Ok(PartDestination::part(presigned.upload_url))
    }

    async fn confirm(&self, chunk: &UploadChunk, _outcome: &PartOutcome) -> Result<()> {
        self.written.lock().insert(chunk.part_number);
        Ok(())
    }
}

/// Parts of one multipart upload
struct MultipartTarget<'a> {
    store: &'a dyn ObjectStore,
    upload_id: &'a str,
    registered: Mutex<BTreeSet<u32>>,
}

#[async_trait]
impl PartTarget for MultipartTarget<'_> {
    async fn destination(&self, chunk: &UploadChunk) -> Result<PartDestination> {
        let url = self
            .store
            .get_multipart_part_url(self.upload_id, chunk.part_number)
            .await?;
        Ok(PartDestination::part(url))
    }

    async fn confirm(&self, chunk: &UploadChunk, outcome: &PartOutcome) -> Result<()> {
        let etag = outcome.etag.as_deref().ok_or_else(|| {
            UploadError::InvalidResponse(format!("part {} returned no ETag", chunk.part_number))
        })?;
        if self.registered.lock().contains(&chunk.part_number) {
            return Err(CoreError::DuplicatePart(chunk.part_number).into());
        }
        self.store
            .register_multipart_part(self.upload_id, chunk.part_number, etag)
            .await?;
        self.registered.lock().insert(chunk.part_number);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use crate::{PartRequest, RetryPolicy};
    use bytes::Bytes;

    fn profile(chunk_size: u64, attempts: u32) -> UploadProfile {
        UploadProfile::multipart()
            .with_chunk_size(chunk_size)
            .with_max_concurrent(1)
            .with_retry(RetryPolicy::new(attempts).with_delays(Duration::from_millis(1), Duration::from_millis(2)))
    }

    fn uploader(store: &MemoryObjectStore, profile: UploadProfile, strategy: MultipartStrategy) -> FileUploader {
        FileUploader::new(Arc::new(store.clone()), Arc::new(store.clone()), &profile, strategy).unwrap()
    }

    fn video(len: usize) -> MediaBlob {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        MediaBlob::new("clip.mp4", "video/mp4", data)
    }

    #[tokio::test]
    async fn test_single_chunk_is_a_direct_put() {
        let store = MemoryObjectStore::new();
        let up = uploader(&store, profile(100, 3), MultipartStrategy::Multipart);
        let blob = video(60);

        let object = up.upload("p/clip.mp4", &blob, None, &CancellationToken::new()).await.unwrap();

        assert_eq!(object.parts, 1);
        assert_eq!(object.public_url, "memory://public/p/clip.mp4");
        assert_eq!(store.object("p/clip.mp4").unwrap(), blob.data);
        assert_eq!(store.call_count("initiate_multipart_upload"), 0);
    }

    #[tokio::test]
    async fn test_presigned_parts_are_composed() {
        let store = MemoryObjectStore::new();
        let up = uploader(&store, profile(10, 3), MultipartStrategy::PresignedParts);
        let blob = video(25);

        let object = up.upload("p/clip.mp4", &blob, None, &CancellationToken::new()).await.unwrap();

        assert_eq!(object.parts, 3);
        assert_eq!(store.call_count("compose_parts"), 1);
        assert_eq!(store.object("p/clip.mp4").unwrap(), blob.data);
        assert_eq!(store.object_names(), vec!["p/clip.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_presigned_parts_failure_deletes_written_parts() {
        let store = MemoryObjectStore::new();
        store.fail_puts_always("clip.mp4.part3", 500);
        let up = uploader(&store, profile(10, 2), MultipartStrategy::PresignedParts);

        let err = up
            .upload("p/clip.mp4", &video(45), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::PartFailed { part_number: 3, .. }));
        assert_eq!(store.call_count("compose_parts"), 0);
        assert_eq!(
            store.deleted_paths(),
            vec!["p/clip.mp4.part1".to_string(), "p/clip.mp4.part2".to_string()]
        );
        assert!(store.object_names().is_empty());
    }

    #[tokio::test]
    async fn test_compose_failure_deletes_every_part() {
        let store = MemoryObjectStore::new();
        store.fail_operation("compose_parts", "quota exceeded");
        let up = uploader(&store, profile(10, 1), MultipartStrategy::PresignedParts);

        let err = up
            .upload("p/clip.mp4", &video(30), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(store.deleted_paths().len(), 3);
        assert!(store.object_names().is_empty());
    }

    #[tokio::test]
    async fn test_multipart_registers_every_part_then_completes() {
        let store = MemoryObjectStore::new();
        let up = uploader(&store, profile(10, 3).with_max_concurrent(3), MultipartStrategy::Multipart);
        let blob = video(95);

        let object = up.upload("p/clip.mp4", &blob, None, &CancellationToken::new()).await.unwrap();

        assert_eq!(object.parts, 10);
        assert_eq!(store.call_count("register_multipart_part"), 10);
        assert_eq!(store.call_count("complete_multipart_upload"), 1);
        assert_eq!(store.object("p/clip.mp4").unwrap(), blob.data);
        assert_eq!(store.open_uploads(), 0);
        assert!(store.peak_in_flight() <= 3);
    }

    #[tokio::test]
    async fn test_part_four_exhausts_two_attempts_and_aborts() {
        let store = MemoryObjectStore::new();
        store.fail_puts("mpu-1/4", 2, 500);
        let up = uploader(&store, profile(10, 2), MultipartStrategy::Multipart);

        let err = up
            .upload("p/clip.mp4", &video(50), None, &CancellationToken::new())
            .await
            .unwrap_err();

        match &err {
            UploadError::PartFailed { part_number, attempts, .. } => {
                assert_eq!(*part_number, 4);
                assert_eq!(*attempts, 2);
            }
            other => panic!("expected PartFailed, got {other:?}"),
        }
        assert_eq!(store.aborted_uploads(), vec!["mpu-1".to_string()]);
        assert_eq!(store.call_count("complete_multipart_upload"), 0);
        assert!(!store.contains("p/clip.mp4"));
    }

    #[tokio::test]
    async fn test_part_four_recovers_on_third_attempt() {
        let store = MemoryObjectStore::new();
        store.fail_puts("mpu-1/4", 2, 500);
        let up = uploader(&store, profile(10, 3), MultipartStrategy::Multipart);

        let object = up
            .upload("p/clip.mp4", &video(50), None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(object.retries, 2);
        assert_eq!(store.put_attempts_matching("mpu-1/4"), 3);
        assert!(store.aborted_uploads().is_empty());
    }

    #[tokio::test]
    async fn test_failed_initiate_has_nothing_to_abort() {
        let store = MemoryObjectStore::new();
        store.fail_operation("initiate_multipart_upload", "denied");
        let up = uploader(&store, profile(10, 3), MultipartStrategy::Multipart);

        let err = up
            .upload("p/clip.mp4", &video(50), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::Backend { .. }));
        assert_eq!(store.call_count("abort_multipart_upload"), 0);
        assert!(store.put_attempts().is_empty());
    }

    #[tokio::test]
    async fn test_abort_failure_keeps_original_error() {
        let store = MemoryObjectStore::new();
        store.fail_puts_always("mpu-1/2", 503);
        store.fail_operation("abort_multipart_upload", "gone");
        let up = uploader(&store, profile(10, 1), MultipartStrategy::Multipart);

        let err = up
            .upload("p/clip.mp4", &video(30), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(503));
        assert_eq!(store.call_count("abort_multipart_upload"), 1);
    }

    /// Forwards to the store but drops ETags
    struct NoEtag(MemoryObjectStore);

    #[async_trait]
    impl PartUploader for NoEtag {
        async fn upload(&self, request: &PartRequest) -> Result<PartOutcome> {
            let mut outcome = self.0.upload(request).await?;
            outcome.etag = None;
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn test_missing_etag_aborts() {
        let store = MemoryObjectStore::new();
        let up = FileUploader::new(
            Arc::new(store.clone()),
            Arc::new(NoEtag(store.clone())),
            &profile(10, 1),
            MultipartStrategy::Multipart,
        )
        .unwrap();

        let err = up
            .upload("p/clip.mp4", &video(30), None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err.root_cause(), UploadError::InvalidResponse(_)));
        assert_eq!(store.call_count("register_multipart_part"), 0);
        assert_eq!(store.aborted_uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_blob_rejected_before_any_call() {
        let store = MemoryObjectStore::new();
        let up = uploader(&store, profile(10, 1), MultipartStrategy::Multipart);
        let blob = MediaBlob::new("notes.pdf", "application/pdf", Bytes::from_static(b"%PDF"));

        let err = up.upload("p/notes.pdf", &blob, None, &CancellationToken::new()).await.unwrap_err();

        assert!(err.is_validation());
        assert!(store.calls().is_empty());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("multipart".parse::<MultipartStrategy>().unwrap(), MultipartStrategy::Multipart);
        assert_eq!(
            "presigned-parts".parse::<MultipartStrategy>().unwrap(),
            MultipartStrategy::PresignedParts
        );
        assert!("ftp".parse::<MultipartStrategy>().is_err());
    }
}
