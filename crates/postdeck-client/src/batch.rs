//! Sequential multi-file uploads with verification

use crate::multipart::{FileUploader, MultipartStrategy, UploadedObject};
use crate::progress::{ProgressFn, ProgressRange, ProgressTracker, UploadProgress};
use crate::{ObjectStore, PartUploader, Result, UploadError, UploadProfile};
use parking_lot::Mutex;
use postdeck_core::MediaBlob;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// One file to upload and where it goes
#[derive(Clone, Debug)]
pub struct BatchFile {
    pub blob: MediaBlob,
    /// Object key
    pub destination: String,
}

impl BatchFile {
    pub fn new(blob: MediaBlob, destination: impl Into<String>) -> Self {
        Self {
            blob,
            destination: destination.into(),
        }
    }
}

/// Outcome of one file in a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileUploadResult {
    pub success: bool,
    /// Object key
    pub path: String,
    pub public_url: Option<String>,
    /// Size in bytes
    pub size: u64,
    /// Failed part attempts along the way
    pub retries: u32,
    pub error: Option<String>,
}

impl FileUploadResult {
    fn confirmed(object: &UploadedObject) -> Self {
        Self {
            success: true,
            path: object.path.clone(),
            public_url: Some(object.public_url.clone()),
            size: object.size,
            retries: object.retries,
            error: None,
        }
    }
}

/// Batch upload configuration
#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Protocol for files larger than one chunk
    pub strategy: MultipartStrategy,
    /// Chunking, concurrency and retry tuning
    pub profile: UploadProfile,
    /// Range the batch reports its progress into
    pub progress_range: ProgressRange,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self::new(MultipartStrategy::default())
    }
}

impl BatchConfig {
    /// Config with the default profile for `strategy`
    pub fn new(strategy: MultipartStrategy) -> Self {
        Self {
            strategy,
            profile: UploadProfile::for_strategy(strategy),
            progress_range: ProgressRange::new(10.0, 85.0),
        }
    }

    /// Set the upload profile
    pub fn with_profile(mut self, profile: UploadProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Set the progress range
    pub fn with_progress_range(mut self, range: ProgressRange) -> Self {
        self.progress_range = range;
        self
    }
}

/// Aggregate across files; only the running batch touches it
struct BatchProgressState {
    tracker: ProgressTracker,
    file_bytes_seen: u64,
}

/// Uploads files one after another
#[derive(Clone)]
pub struct BatchUploader {
    files: FileUploader,
    store: Arc<dyn ObjectStore>,
    config: BatchConfig,
}

impl BatchUploader {
    /// Create a batch uploader
    pub fn new(
        store: Arc<dyn ObjectStore>,
        part_uploader: Arc<dyn PartUploader>,
        config: BatchConfig,
    ) -> Result<Self> {
        let files = FileUploader::new(store.clone(), part_uploader, &config.profile, config.strategy)?;
        Ok(Self {
            files,
            store,
            config,
        })
    }

    /// Get the configuration
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Upload every file in order
    ///
    /// Each file is verified right after its upload and only then passed to
    /// `on_confirmed`. The first failing file stops the batch with
    /// [`UploadError::FileFailed`]. Once every file is in, all paths are
    /// verified again; missing ones yield [`UploadError::Verification`].
    #[instrument(skip_all, fields(files = files.len()))]
    pub async fn upload_all<F>(
        &self,
        files: &[BatchFile],
        progress: Option<ProgressFn<'_>>,
        mut on_confirmed: F,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileUploadResult>>
    where
        F: FnMut(&FileUploadResult) + Send,
    {
        let total = files.len();
        let file_failed = |index: usize, source: UploadError| UploadError::FileFailed {
            index: index + 1,
            total,
            name: files[index].blob.name.clone(),
            source: Box::new(source),
        };

        for (i, file) in files.iter().enumerate() {
            file.blob.validate().map_err(|e| file_failed(i, e.into()))?;
        }

        let total_bytes: u64 = files.iter().map(|f| f.blob.size()).sum();
        let total_parts: usize = files.iter().map(|f| self.files.parts_for(f.blob.size())).sum();
        let state = Mutex::new(BatchProgressState {
            tracker: ProgressTracker::with_range(total_bytes, total_parts as u32, self.config.progress_range),
            file_bytes_seen: 0,
        });
        info!(total_bytes, total_parts, "starting batch upload");

        let mut results = Vec::with_capacity(total);
        for (i, file) in files.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(file_failed(i, UploadError::Cancelled));
            }
            state.lock().file_bytes_seen = 0;

            let on_part = |p: UploadProgress| {
                let snapshot = {
                    let mut s = state.lock();
                    let delta = p.bytes_uploaded.saturating_sub(s.file_bytes_seen);
                    s.file_bytes_seen = p.bytes_uploaded;
                    s.tracker.record_part(delta)
                };
                if let Some(cb) = progress {
                    cb(snapshot);
                }
            };

            let result = self
                .upload_one(file, &on_part, cancel)
                .await
                .map_err(|e| file_failed(i, e));
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    error!(index = i + 1, total, file = %file.blob.name, error = %err, "batch stopped");
                    return Err(err);
                }
            };

            debug!(index = i + 1, total, path = %result.path, "file confirmed");
            on_confirmed(&result);
            results.push(result);
        }

        let mut missing = Vec::new();
        for result in &results {
            let exists = self
                .store
                .verify_upload(&result.path)
                .await
                .map_err(|e| e.in_step("final verification"))?;
            if !exists {
                missing.push(result.path.clone());
            }
        }
        if !missing.is_empty() {
            error!(missing = missing.len(), "final verification failed");
            return Err(UploadError::Verification { missing });
        }

        info!(files = results.len(), total_bytes, "batch upload finished");
        Ok(results)
    }

    async fn upload_one(
        &self,
        file: &BatchFile,
        on_part: ProgressFn<'_>,
        cancel: &CancellationToken,
    ) -> Result<FileUploadResult> {
        let object = self
            .files
            .upload(&file.destination, &file.blob, Some(on_part), cancel)
            .await?;

        let exists = self
            .store
            .verify_upload(&object.path)
            .await
            .map_err(|e| e.in_step("verification"))?;
        if !exists {
            return Err(UploadError::Verification {
                missing: vec![object.path],
            });
        }
        Ok(FileUploadResult::confirmed(&object))
    }
}
