//! Chunk planning for part uploads
//!
//! Splits a blob into contiguous byte ranges, one per upload part

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// One contiguous slice of a file, uploaded as an independent request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadChunk {
    /// Zero-based position in the file
    pub index: usize,
    /// One-based part number (`index + 1`)
    pub part_number: u32,
    /// First byte (inclusive)
    pub start: u64,
    /// Last byte (exclusive)
    pub end: u64,
    /// Whether the part has been uploaded
    pub uploaded: bool,
    /// Failed attempts before the part went through
    pub retries: u32,
}

impl UploadChunk {
    /// Size of the chunk in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Byte range as a `usize` range for slicing in-memory data
    pub fn byte_range(&self) -> Range<usize> {
        self.start as usize..self.end as usize
    }
}

/// Splits blobs into fixed-size chunks
#[derive(Clone, Copy, Debug)]
pub struct ChunkSplitter {
    chunk_size: u64,
}

impl ChunkSplitter {
    /// Create a splitter with the given chunk size
    pub fn new(chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CoreError::InvalidChunkSize(chunk_size));
        }
        Ok(Self { chunk_size })
    }

    /// Get the chunk size
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Plan the chunks covering `[0, total_size)`
    pub fn split(&self, total_size: u64) -> Vec<UploadChunk> {
        let count = calculate_chunk_count(total_size, self.chunk_size);
        (0..count)
            .map(|index| {
                let start = index as u64 * self.chunk_size;
                let end = (start + self.chunk_size).min(total_size);
                UploadChunk {
                    index,
                    part_number: index as u32 + 1,
                    start,
                    end,
                    uploaded: false,
                    retries: 0,
                }
            })
            .collect()
    }
}

/// Calculate how many chunks will be needed for a given size
pub fn calculate_chunk_count(size: u64, chunk_size: u64) -> usize {
    if size == 0 || chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size) as usize
}

/// Calculate the size of the last chunk
pub fn last_chunk_size(total_size: u64, chunk_size: u64) -> u64 {
    if total_size == 0 || chunk_size == 0 {
        return 0;
    }
    match total_size % chunk_size {
        0 => chunk_size,
        remainder => remainder,
    }
}
