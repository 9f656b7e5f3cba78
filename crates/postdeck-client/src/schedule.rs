//! Scheduling a post: the saga and its rollback
//!
//! `Validating -> RecordCreated -> Uploading -> MediaLinked -> Verified -> Done`.
//! Any failure once the record exists rolls back: the record is deleted (its
//! media references go with it, see [`RecordStore::delete_post`]) and so are
//! exactly the object paths whose upload was confirmed.

use crate::batch::{BatchConfig, BatchFile, BatchUploader};
use crate::progress::UploadProgress;
use crate::types::{MediaRef, NewPost, PostId, PostStatus};
use crate::{ObjectStore, PartUploader, RecordStore, Result, UploadError};
use chrono::Utc;
use parking_lot::Mutex;
use postdeck_core::{post_media_path, PostDraft, ValidationError};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Where a scheduling run is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleStage {
    Validating,
    RecordCreated,
    Uploading,
    MediaLinked,
    Verified,
    Done,
    Failed,
    RollingBack,
    RolledBack,
}

impl ScheduleStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::RecordCreated => "record_created",
            Self::Uploading => "uploading",
            Self::MediaLinked => "media_linked",
            Self::Verified => "verified",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for ScheduleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side effects of one run that rollback has to undo
///
/// Paths are only ever appended, and only once the object is confirmed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleTransaction {
    post_id: Option<PostId>,
    uploaded_paths: Vec<String>,
}

impl ScheduleTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the created record
    pub fn record_created(&mut self, post_id: PostId) {
        self.post_id = Some(post_id);
    }

    /// Track an object whose upload and verification succeeded
    pub fn confirm_upload(&mut self, path: impl Into<String>) {
        self.uploaded_paths.push(path.into());
    }

    pub fn post_id(&self) -> Option<&PostId> {
        self.post_id.as_ref()
    }

    pub fn uploaded_paths(&self) -> &[String] {
        &self.uploaded_paths
    }

    /// Nothing to roll back
    pub fn is_empty(&self) -> bool {
        self.post_id.is_none() && self.uploaded_paths.is_empty()
    }
}

/// What rollback managed to undo
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// The post record (and its media references) is gone
    pub record_deleted: bool,
    /// Object paths deleted
    pub deleted_paths: Vec<String>,
    /// Compensation failures, never surfaced in place of the original error
    pub errors: Vec<String>,
}

impl RollbackReport {
    /// Everything was undone
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Summary of a scheduled post
#[derive(Clone, Debug)]
pub struct ScheduleReport {
    pub post_id: PostId,
    pub file_count: usize,
    pub total_bytes: u64,
    pub elapsed: Duration,
    /// Media references saved against the post, in order
    pub media: Vec<MediaRef>,
}

/// A failed run
///
/// `error` is always the failure that stopped the run; rollback problems are
/// reported beside it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ScheduleFailure {
    /// Last stage the run reached before failing
    pub stage: ScheduleStage,
    pub error: UploadError,
    /// Present once the record was created
    pub rollback: Option<RollbackReport>,
}

impl ScheduleFailure {
    fn new(stage: ScheduleStage, error: UploadError) -> Self {
        Self {
            stage,
            error,
            rollback: None,
        }
    }

    /// One-line message for the user
    pub fn message(&self) -> String {
        self.error.to_string()
    }

    /// Cause chain and rollback problems, one per line
    pub fn detail(&self) -> Option<String> {
        let mut lines: Vec<String> = self.error.detail().into_iter().collect();
        if let Some(rollback) = &self.rollback {
            lines.extend(rollback.errors.iter().map(|e| format!("rollback: {e}")));
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

/// Saga configuration
#[derive(Clone, Debug)]
pub struct ScheduleConfig {
    /// First segment of every media path
    pub folder_prefix: String,
    /// Upload tuning; its progress range is the uploading stage's share
    pub batch: BatchConfig,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            folder_prefix: "posts".to_string(),
            batch: BatchConfig::default(),
        }
    }
}

impl ScheduleConfig {
    /// Set the folder prefix
    pub fn with_folder_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.folder_prefix = prefix.into();
        self
    }

    /// Set the batch configuration
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }
}

/// Progress of a scheduling run
#[derive(Clone, Debug, PartialEq)]
pub struct ScheduleProgress {
    pub stage: ScheduleStage,
    /// Overall percentage, never decreasing
    pub percent: f64,
    pub message: String,
    /// Byte-level detail while uploading
    pub upload: Option<UploadProgress>,
}

/// Borrowed schedule progress callback
pub type ScheduleProgressFn<'a> = &'a (dyn Fn(ScheduleProgress) + Send + Sync);

const RECORD_CREATED_PERCENT: f64 = 5.0;
const MEDIA_LINKED_PERCENT: f64 = 90.0;
const VERIFIED_PERCENT: f64 = 95.0;

/// Emits stage progress without ever moving backwards
struct StageReporter<'a> {
    callback: Option<ScheduleProgressFn<'a>>,
    last: Mutex<f64>,
}

impl<'a> StageReporter<'a> {
    fn new(callback: Option<ScheduleProgressFn<'a>>) -> Self {
        Self {
            callback,
            last: Mutex::new(0.0),
        }
    }

    fn emit(&self, stage: ScheduleStage, percent: f64, message: impl Into<String>, upload: Option<UploadProgress>) {
        let percent = {
            let mut last = self.last.lock();
            *last = last.max(percent);
            *last
        };
        if let Some(cb) = self.callback {
            cb(ScheduleProgress {
                stage,
                percent,
                message: message.into(),
                upload,
            });
        }
    }

    /// Keep the current percentage
    fn emit_stage(&self, stage: ScheduleStage, message: impl Into<String>) {
        self.emit(stage, 0.0, message, None);
    }
}

/// Runs the schedule-post saga
#[derive(Clone)]
pub struct ScheduleOrchestrator {
    records: Arc<dyn RecordStore>,
    objects: Arc<dyn ObjectStore>,
    batch: BatchUploader,
    config: ScheduleConfig,
}

impl ScheduleOrchestrator {
    /// Create an orchestrator
    pub fn new(
        records: Arc<dyn RecordStore>,
        objects: Arc<dyn ObjectStore>,
        part_uploader: Arc<dyn PartUploader>,
        config: ScheduleConfig,
    ) -> Result<Self> {
        let batch = BatchUploader::new(objects.clone(), part_uploader, config.batch.clone())?;
        Ok(Self {
            records,
            objects,
            batch,
            config,
        })
    }

    /// Validate, create, upload, link and verify a post
    ///
    /// Validation failures happen before any call. Later failures roll back
    /// what was done and come back with the rollback report.
    #[instrument(skip_all, fields(client = draft.client_id.as_deref().unwrap_or(""), files = draft.media.len()))]
    pub async fn run(
        &self,
        draft: &PostDraft,
        progress: Option<ScheduleProgressFn<'_>>,
        cancel: &CancellationToken,
    ) -> std::result::Result<ScheduleReport, ScheduleFailure> {
        let started = Instant::now();
        let reporter = StageReporter::new(progress);
        reporter.emit(ScheduleStage::Validating, 0.0, "validating post", None);

        let new_post = Self::prepare(draft).map_err(|e| {
            warn!(error = %e, "post rejected");
            ScheduleFailure::new(ScheduleStage::Validating, e.into())
        })?;

        let mut tx = ScheduleTransaction::new();
        let mut stage = ScheduleStage::Validating;
        match self
            .execute(draft, &new_post, &mut tx, &mut stage, &reporter, cancel)
            .await
        {
            Ok((post_id, media)) => {
                let report = ScheduleReport {
                    post_id,
                    file_count: media.len(),
                    total_bytes: draft.total_bytes(),
                    elapsed: started.elapsed(),
                    media,
                };
                reporter.emit(ScheduleStage::Done, 100.0, "post scheduled", None);
                info!(
                    post_id = %report.post_id,
                    files = report.file_count,
                    total_bytes = report.total_bytes,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "post scheduled"
                );
                Ok(report)
            }
            Err(err) => {
                error!(stage = %stage, error = %err, "scheduling failed");
                reporter.emit_stage(ScheduleStage::Failed, err.to_string());

                let mut failure = ScheduleFailure::new(stage, err);
                if !tx.is_empty() {
                    reporter.emit_stage(ScheduleStage::RollingBack, "rolling back");
                    let rollback = self.rollback(&tx).await;
                    reporter.emit_stage(
                        ScheduleStage::RolledBack,
                        if rollback.is_clean() {
                            "rolled back"
                        } else {
                            "rolled back with errors"
                        },
                    );
                    failure.rollback = Some(rollback);
                }
                Err(failure)
            }
        }
    }

    fn prepare(draft: &PostDraft) -> std::result::Result<NewPost, ValidationError> {
        draft.validate(Utc::now())?;
        match (&draft.client_id, draft.post_type, draft.scheduled_at) {
            (Some(client_id), Some(post_type), Some(scheduled_at)) => Ok(NewPost {
                client_id: client_id.clone(),
                post_type,
                caption: draft.caption.clone(),
                scheduled_at,
                status: PostStatus::Pending,
            }),
            _ => Err(ValidationError::new("post", "client, post type and time are required")),
        }
    }

    async fn execute(
        &self,
        draft: &PostDraft,
        new_post: &NewPost,
        tx: &mut ScheduleTransaction,
        stage: &mut ScheduleStage,
        reporter: &StageReporter<'_>,
        cancel: &CancellationToken,
    ) -> Result<(PostId, Vec<MediaRef>)> {
        let post_id = self.records.create_post(new_post).await?;
        tx.record_created(post_id.clone());
        *stage = ScheduleStage::RecordCreated;
        info!(post_id = %post_id, "post record created");
        reporter.emit(ScheduleStage::RecordCreated, RECORD_CREATED_PERCENT, format!("created post {post_id}"), None);

        *stage = ScheduleStage::Uploading;
        let files: Vec<BatchFile> = draft
            .media
            .iter()
            .enumerate()
            .map(|(i, blob)| {
                let path = post_media_path(
                    &self.config.folder_prefix,
                    &new_post.client_id,
                    post_id.as_str(),
                    i,
                    &blob.name,
                );
                BatchFile::new(blob.clone(), path)
            })
            .collect();

        let on_upload = |p: UploadProgress| {
            let message = format!("uploading media ({}/{} parts)", p.completed_parts, p.total_parts);
            reporter.emit(ScheduleStage::Uploading, p.percent, message, Some(p));
        };
        let uploaded = self
            .batch
            .upload_all(&files, Some(&on_upload), |r| tx.confirm_upload(r.path.clone()), cancel)
            .await?;

        let media: Vec<MediaRef> = uploaded
            .iter()
            .zip(&draft.media)
            .enumerate()
            .map(|(i, (result, blob))| -> Result<MediaRef> {
                Ok(MediaRef {
                    url: result.public_url.clone().unwrap_or_default(),
                    path: result.path.clone(),
                    order: i as u32,
                    kind: blob.kind().ok_or_else(|| {
                        UploadError::from(ValidationError::new("media", format!("{}: unsupported type", blob.name)))
                    })?,
                    mime_type: blob.mime_type.clone(),
                    size: blob.size(),
                })
            })
            .collect::<Result<_>>()?;

        let saved = self.records.save_media_refs(&post_id, &media).await?;
        if saved != media.len() {
            return Err(UploadError::backend(
                "save_media_refs",
                format!("saved {saved} of {} media references", media.len()),
            ));
        }
        *stage = ScheduleStage::MediaLinked;
        reporter.emit(ScheduleStage::MediaLinked, MEDIA_LINKED_PERCENT, "media linked", None);

        let mut missing = Vec::new();
        for path in tx.uploaded_paths() {
            if !self.objects.verify_upload(path).await? {
                missing.push(path.clone());
            }
        }
        if !missing.is_empty() {
            return Err(UploadError::Verification { missing });
        }
        *stage = ScheduleStage::Verified;
        reporter.emit(ScheduleStage::Verified, VERIFIED_PERCENT, "media verified", None);

        Ok((post_id, media))
    }

    /// Undo a failed run; never fails, problems land in the report
    async fn rollback(&self, tx: &ScheduleTransaction) -> RollbackReport {
        let mut report = RollbackReport::default();

        if let Some(post_id) = tx.post_id() {
            match self.records.delete_post(post_id).await {
                Ok(()) => report.record_deleted = true,
                Err(err) => {
                    warn!(post_id = %post_id, error = %err, "rollback could not delete post");
                    report.errors.push(format!("delete post {post_id}: {err}"));
                }
            }
        }

        let paths = tx.uploaded_paths();
        if !paths.is_empty() {
            match self.objects.delete_files(paths).await {
                Ok(()) => report.deleted_paths = paths.to_vec(),
                Err(err) => {
                    warn!(files = paths.len(), error = %err, "rollback could not delete media");
                    report.errors.push(format!("delete {} files: {err}", paths.len()));
                }
            }
        }

        info!(
            record_deleted = report.record_deleted,
            files_deleted = report.deleted_paths.len(),
            errors = report.errors.len(),
            "rollback finished"
        );
        report
    }
}
