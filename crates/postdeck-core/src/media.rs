//! Media files and the constraints checked before upload

use crate::{ValidationError, MAX_FILE_SIZE};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// MIME types accepted for upload
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "video/mp4",
    "video/quicktime",
    "video/avi",
    "video/x-msvideo",
];

/// Kind of media, as stored against a post
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Derive the kind from a MIME type
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        if mime_type.starts_with("image/") {
            Some(Self::Image)
        } else if mime_type.starts_with("video/") {
            Some(Self::Video)
        } else {
            None
        }
    }
}

/// A media file held in memory, ready to upload
#[derive(Clone, Debug)]
pub struct MediaBlob {
    /// Original file name
    pub name: String,
    /// MIME type
    pub mime_type: String,
    /// File contents
    pub data: Bytes,
}

impl MediaBlob {
    /// Create a blob
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Kind derived from the MIME type
    pub fn kind(&self) -> Option<MediaKind> {
        MediaKind::from_mime(&self.mime_type)
    }

    /// Check type and size constraints
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !ALLOWED_MIME_TYPES.contains(&self.mime_type.as_str()) {
            return Err(ValidationError::new(
                "media",
                format!("{}: unsupported type {}", self.name, self.mime_type),
            ));
        }
        if self.data.is_empty() {
            return Err(ValidationError::new(
                "media",
                format!("{}: file is empty", self.name),
            ));
        }
        if self.size() > MAX_FILE_SIZE {
            return Err(ValidationError::new(
                "media",
                format!(
                    "{}: {} bytes exceeds the {} byte limit",
                    self.name,
                    self.size(),
                    MAX_FILE_SIZE
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("image/jpeg", true)]
    #[case("image/webp", true)]
    #[case("video/quicktime", true)]
    #[case("video/x-msvideo", true)]
    #[case("image/svg+xml", false)]
    #[case("application/pdf", false)]
    fn test_mime_allow_list(#[case] mime: &str, #[case] accepted: bool) {
        let blob = MediaBlob::new("f", mime, vec![1u8; 8]);
        assert_eq!(blob.validate().is_ok(), accepted);
    }

    #[test]
    fn test_empty_file_rejected() {
        let blob = MediaBlob::new("empty.png", "image/png", Bytes::new());
        assert!(blob.validate().unwrap_err().message.contains("empty"));
    }

    #[test]
    fn test_kind() {
        assert_eq!(MediaKind::from_mime("video/mp4"), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_mime("image/gif"), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_mime("text/plain"), None);
    }
}
