//! Upload session bookkeeping and the multipart lifecycle

use crate::{ChunkSplitter, CoreError, Result, UploadChunk};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of one uploaded part
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartResult {
    /// Backend-issued ETag, when the backend returned one
    pub etag: Option<String>,
    /// Time spent on the successful attempt
    pub elapsed_ms: u64,
}

/// Multipart lifecycle
///
/// `NotStarted -> Initiated -> PartsUploading -> PartsRegistered -> Completed`,
/// with `Aborted` reachable from any state after `Initiated`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MultipartState {
    NotStarted,
    Initiated { upload_id: String },
    PartsUploading { upload_id: String },
    PartsRegistered { upload_id: String },
    Completed { public_url: String },
    Aborted,
}

impl MultipartState {
    /// Name of the state, for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Initiated { .. } => "initiated",
            Self::PartsUploading { .. } => "parts_uploading",
            Self::PartsRegistered { .. } => "parts_registered",
            Self::Completed { .. } => "completed",
            Self::Aborted => "aborted",
        }
    }

    /// Upload ID assigned by the backend, if one was obtained
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            Self::Initiated { upload_id }
            | Self::PartsUploading { upload_id }
            | Self::PartsRegistered { upload_id } => Some(upload_id),
            _ => None,
        }
    }

    /// Whether a failure in this state needs a backend-side abort
    pub fn needs_abort(&self) -> bool {
        self.upload_id().is_some()
    }

    /// Record the backend-assigned upload ID
    pub fn initiated(&mut self, upload_id: String) -> Result<()> {
        match self {
            Self::NotStarted => {
                *self = Self::Initiated { upload_id };
                Ok(())
            }
            _ => Err(self.invalid("initiated")),
        }
    }

    /// Begin uploading parts
    pub fn uploading(&mut self) -> Result<()> {
        match self {
            Self::Initiated { upload_id } => {
                *self = Self::PartsUploading {
                    upload_id: std::mem::take(upload_id),
                };
                Ok(())
            }
            _ => Err(self.invalid("parts_uploading")),
        }
    }

    /// Every part has been uploaded and registered
    pub fn registered(&mut self) -> Result<()> {
        match self {
            Self::PartsUploading { upload_id } => {
                *self = Self::PartsRegistered {
                    upload_id: std::mem::take(upload_id),
                };
                Ok(())
            }
            _ => Err(self.invalid("parts_registered")),
        }
    }

    /// The backend assembled the object
    pub fn completed(&mut self, public_url: String) -> Result<()> {
        match self {
            Self::PartsRegistered { .. } => {
                *self = Self::Completed { public_url };
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// The session was abandoned
    pub fn aborted(&mut self) -> Result<()> {
        if self.needs_abort() {
            *self = Self::Aborted;
            Ok(())
        } else {
            Err(self.invalid("aborted"))
        }
    }

    fn invalid(&self, to: &'static str) -> CoreError {
        CoreError::InvalidTransition {
            from: self.name(),
            to,
        }
    }
}

/// State of one large-file upload
#[derive(Clone, Debug)]
pub struct UploadSession {
    /// Backend upload ID (true multipart only)
    pub upload_id: Option<String>,
    /// Destination object name
    pub file_name: String,
    /// Size of the whole file
    pub total_bytes: u64,
    /// Planned chunks in ascending order
    pub chunks: Vec<UploadChunk>,
    part_results: BTreeMap<u32, PartResult>,
}

impl UploadSession {
    /// Plan a session for a file of `total_bytes`
    pub fn new(file_name: impl Into<String>, total_bytes: u64, splitter: &ChunkSplitter) -> Self {
        Self {
            upload_id: None,
            file_name: file_name.into(),
            total_bytes,
            chunks: splitter.split(total_bytes),
            part_results: BTreeMap::new(),
        }
    }

    /// Number of planned parts
    pub fn total_parts(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Record a successful part; each part may be recorded once
    pub fn record_part(&mut self, part_number: u32, retries: u32, result: PartResult) -> Result<()> {
        let total_parts = self.total_parts();
        if part_number == 0 || part_number > total_parts {
            return Err(CoreError::UnknownPart {
                part_number,
                total_parts,
            });
        }
        if self.part_results.contains_key(&part_number) {
            return Err(CoreError::DuplicatePart(part_number));
        }

        let chunk = &mut self.chunks[part_number as usize - 1];
        chunk.uploaded = true;
        chunk.retries = retries;
        self.part_results.insert(part_number, result);
        Ok(())
    }

    /// Results recorded so far
    pub fn part_results(&self) -> &BTreeMap<u32, PartResult> {
        &self.part_results
    }

    /// Bytes covered by recorded parts
    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks.iter().filter(|c| c.uploaded).map(|c| c.size()).sum()
    }

    /// All parts in ascending order, or the gaps that prevent finalizing
    pub fn ordered_parts(&self) -> Result<Vec<(u32, &PartResult)>> {
        let missing: Vec<u32> = (1..=self.total_parts())
            .filter(|n| !self.part_results.contains_key(n))
            .collect();
        if !missing.is_empty() {
            return Err(CoreError::MissingParts { missing });
        }
        Ok(self.part_results.iter().map(|(n, r)| (*n, r)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(size: u64, chunk: u64) -> UploadSession {
        UploadSession::new("clip.mp4", size, &ChunkSplitter::new(chunk).unwrap())
    }

    fn ok(etag: &str) -> PartResult {
        PartResult {
            etag: Some(etag.to_string()),
            elapsed_ms: 5,
        }
    }

    #[test]
    fn test_record_parts_out_of_order() {
        let mut s = session(10, 4);
        s.record_part(3, 0, ok("c")).unwrap();
        s.record_part(1, 2, ok("a")).unwrap();
        s.record_part(2, 0, ok("b")).unwrap();

        let parts = s.ordered_parts().unwrap();
        let numbers: Vec<u32> = parts.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(s.chunks[0].retries, 2);
        assert_eq!(s.uploaded_bytes(), 10);
    }

    #[test]
    fn test_duplicate_part_rejected() {
        let mut s = session(10, 4);
        s.record_part(1, 0, ok("a")).unwrap();
        assert_eq!(s.record_part(1, 0, ok("a")), Err(CoreError::DuplicatePart(1)));
    }

    #[test]
    fn test_unknown_part_rejected() {
        let mut s = session(10, 4);
        assert!(matches!(
            s.record_part(0, 0, ok("a")),
            Err(CoreError::UnknownPart { .. })
        ));
        assert!(matches!(
            s.record_part(4, 0, ok("a")),
            Err(CoreError::UnknownPart { part_number: 4, total_parts: 3 })
        ));
    }

    #[test]
    fn test_gap_blocks_finalize() {
        let mut s = session(10, 4);
        s.record_part(1, 0, ok("a")).unwrap();
        s.record_part(3, 0, ok("c")).unwrap();
        assert_eq!(
            s.ordered_parts().unwrap_err(),
            CoreError::MissingParts { missing: vec![2] }
        );
    }

    #[test]
    fn test_state_machine_happy_path() {
        let mut state = MultipartState::NotStarted;
        assert!(!state.needs_abort());

        state.initiated("up-1".to_string()).unwrap();
        assert_eq!(state.upload_id(), Some("up-1"));
        state.uploading().unwrap();
        state.registered().unwrap();
        assert!(state.needs_abort());
        state.completed("https://cdn/x".to_string()).unwrap();
        assert_eq!(state.name(), "completed");
        assert!(!state.needs_abort());
    }

    #[test]
    fn test_state_machine_rejects_skips() {
        let mut state = MultipartState::NotStarted;
        assert!(state.uploading().is_err());
        assert!(state.aborted().is_err());

        state.initiated("up-1".to_string()).unwrap();
        assert!(state.completed("x".to_string()).is_err());
        state.aborted().unwrap();
        assert_eq!(state, MultipartState::Aborted);
        assert!(state.initiated("up-2".to_string()).is_err());
    }
}
