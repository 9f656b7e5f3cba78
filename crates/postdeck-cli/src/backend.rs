//! Collaborators the commands run against

use crate::settings::Settings;
use anyhow::{Context, Result};
use bytes::Bytes;
use postdeck_client::{
    FileUploader, HttpObjectStore, HttpPartUploader, HttpRecordStore, MediaBlob,
    MemoryObjectStore, MemoryRecordStore, MultipartStrategy, ObjectStore, PartUploader,
    RecordStore, ScheduleOrchestrator, SessionToken,
};
use std::path::Path;
use std::sync::Arc;

/// Email of the user a dry run is logged in as
pub const DRY_RUN_EMAIL: &str = "demo@postdeck.local";

const DRY_RUN_PASSWORD: &str = "demo";

/// Record store, object store and part uploader for one invocation
pub struct Backend {
    pub records: Arc<dyn RecordStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub parts: Arc<dyn PartUploader>,
    pub dry_run: bool,
}

impl Backend {
    /// Backend talking to the configured HTTP endpoints
    pub fn http(settings: &Settings, token: Option<String>) -> Result<Self> {
        let config = settings.client_config(token);
        let session = SessionToken::new(config.access_token.clone());
        Ok(Self {
            records: Arc::new(
                HttpRecordStore::new(&config, session.clone()).context("invalid API URL")?,
            ),
            objects: Arc::new(HttpObjectStore::new(&config, session).context("invalid storage URL")?),
            parts: Arc::new(HttpPartUploader::new(&config)?),
            dry_run: false,
        })
    }

    /// In-memory backend, already logged in as `email`
    pub async fn memory(email: Option<&str>, password: Option<&str>) -> Result<Self> {
        let email = email.unwrap_or(DRY_RUN_EMAIL);
        let password = password.unwrap_or(DRY_RUN_PASSWORD);
        let records = MemoryRecordStore::new()
            .with_user(email, password)
            .with_client("demo", "Demo client");
        records.login(email, password).await?;
        let objects = MemoryObjectStore::new();

        Ok(Self {
            records: Arc::new(records),
            objects: Arc::new(objects.clone()),
            parts: Arc::new(objects),
            dry_run: true,
        })
    }

    /// Single-file uploader for `strategy`
    pub fn file_uploader(&self, settings: &Settings, strategy: MultipartStrategy) -> Result<FileUploader> {
        let profile = settings.profile(strategy)?;
        Ok(FileUploader::new(
            self.objects.clone(),
            self.parts.clone(),
            &profile,
            strategy,
        )?)
    }

    /// Scheduling saga for `strategy`
    pub fn orchestrator(&self, settings: &Settings, strategy: MultipartStrategy) -> Result<ScheduleOrchestrator> {
        Ok(ScheduleOrchestrator::new(
            self.records.clone(),
            self.objects.clone(),
            self.parts.clone(),
            settings.schedule_config(strategy)?,
        )?)
    }
}

/// Read a media file, guessing its MIME type from the extension
pub async fn read_media(path: &Path) -> Result<MediaBlob> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} is not a file", path.display()))?;
    let mime_type = mime_guess::from_path(path).first_or_octet_stream();

    Ok(MediaBlob::new(name, mime_type.essence_str(), Bytes::from(data)))
}
