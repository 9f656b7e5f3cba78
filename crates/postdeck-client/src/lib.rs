//! # Postdeck Client
//!
//! Upload engine for scheduling social media posts with large media files.
//!
//! ## Features
//!
//! - **Chunked uploads**: Files are split into parts and sent to presigned URLs
//! - **Bounded concurrency**: A self-refilling pool keeps a fixed number of parts in flight
//! - **Retries**: Capped exponential backoff per part, cancellable at any point
//! - **Two multipart protocols**: Presigned part objects with a compose step, or
//!   initiate / register / complete sessions that abort on failure
//! - **Rollback**: A failed post deletes its record and every confirmed object
//!
//! ## Example
//!
//! ```rust,ignore
//! use postdeck_client::{
//!     ClientConfig, HttpObjectStore, HttpPartUploader, HttpRecordStore, ScheduleConfig,
//!     ScheduleOrchestrator, SessionToken,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig::new("https://api.example.com", "https://files.example.com")
//!         .with_token("your-token");
//!     let token = SessionToken::new(config.access_token.clone());
//!
//!     let orchestrator = ScheduleOrchestrator::new(
//!         Arc::new(HttpRecordStore::new(&config, token.clone())?),
//!         Arc::new(HttpObjectStore::new(&config, token)?),
//!         Arc::new(HttpPartUploader::new(&config)?),
//!         ScheduleConfig::default(),
//!     )?;
//!
//!     let report = orchestrator.run(&draft, None, &CancellationToken::new()).await?;
//!     println!("scheduled post {}", report.post_id);
//!     Ok(())
//! }
//! ```

mod batch;
mod config;
mod error;
mod http;
pub mod memory;
mod multipart;
mod part;
mod progress;
mod queue;
mod retry;
mod schedule;
mod store;
mod types;

pub use batch::{BatchConfig, BatchFile, BatchUploader, FileUploadResult};
pub use config::{ClientConfig, UploadProfile};
pub use error::{Result, UploadError};
pub use http::{ApiClient, HttpObjectStore, HttpRecordStore, SessionToken};
pub use memory::{MemoryObjectStore, MemoryRecordStore};
pub use multipart::{FileUploader, MultipartStrategy, UploadedObject};
pub use part::{ContentRange, HttpPartUploader, PartOutcome, PartRequest, PartUploader};
pub use progress::{ProgressCallback, ProgressFn, ProgressRange, ProgressTracker, UploadProgress};
pub use queue::{ConcurrentUploadQueue, PartDestination, PartReport, PartTarget, QueueReport};
pub use retry::{PartSuccess, RetryPolicy, RetryingPartUploader};
pub use schedule::{
    RollbackReport, ScheduleConfig, ScheduleFailure, ScheduleOrchestrator, ScheduleProgress,
    ScheduleProgressFn, ScheduleReport, ScheduleStage, ScheduleTransaction,
};
pub use store::{ObjectStore, RecordStore};
pub use types::*;

// Re-export the domain model
pub use postdeck_core::{MediaBlob, MediaKind, PostDraft, PostType};
