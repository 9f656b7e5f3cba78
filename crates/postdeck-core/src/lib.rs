//! # Postdeck Core
//!
//! Domain model for the postdeck media pipeline.
//!
//! This crate provides:
//! - **Chunking**: Split a media blob into contiguous, 1-based upload parts
//! - **Sessions**: Part bookkeeping and the multipart lifecycle state machine
//! - **Media constraints**: MIME allow-list and size limits checked before any upload
//! - **Post drafts**: Validation of a scheduled post before any side effect
//! - **Storage paths**: Deterministic per-post object keys
//!
//! Nothing in here performs I/O; the async engine lives in `postdeck-client`.

pub mod chunk;
pub mod error;
pub mod media;
pub mod path;
pub mod post;
pub mod session;

pub use chunk::{calculate_chunk_count, last_chunk_size, ChunkSplitter, UploadChunk};
pub use error::{CoreError, Result, ValidationError};
pub use media::{MediaBlob, MediaKind};
pub use path::{part_object_name, post_media_path, sanitize_file_name};
pub use post::{PostDraft, PostType};
pub use session::{MultipartState, PartResult, UploadSession};

/// One mebibyte
pub const MIB: u64 = 1024 * 1024;

/// Chunk size for the presigned-parts upload path (5 MiB)
pub const PRESIGNED_PART_CHUNK_SIZE: u64 = 5 * MIB;

/// Chunk size for the true multipart upload path (40 MiB)
pub const MULTIPART_CHUNK_SIZE: u64 = 40 * MIB;

/// Largest media file accepted for upload (500 MiB)
pub const MAX_FILE_SIZE: u64 = 500 * MIB;

/// Longest caption accepted, in characters
pub const MAX_CAPTION_CHARS: usize = 2200;
