//! Upload error taxonomy

use postdeck_core::{CoreError, ValidationError};
use std::error::Error as _;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, UploadError>;

/// Errors raised by the upload engine and its collaborators
#[derive(Error, Debug)]
pub enum UploadError {
    /// Bad input, reported before any side effect
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Transport failure
    #[error("network error: {0}")]
    Network(String),

    /// Request deadline exceeded
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Non-2xx response
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Uploaded objects could not be found afterwards
    #[error("verification failed, missing objects: {}", .missing.join(", "))]
    Verification { missing: Vec<String> },

    /// A collaborator answered with a failure payload
    #[error("{operation} failed: {message}")]
    Backend { operation: String, message: String },

    /// Domain rule violated (missing or duplicate parts, bad transitions)
    #[error("{0}")]
    Core(#[from] CoreError),

    /// A part exhausted its attempts
    #[error("part {part_number} failed after {attempts} attempts: {source}")]
    PartFailed {
        part_number: u32,
        attempts: u32,
        #[source]
        source: Box<UploadError>,
    },

    /// One file of a batch failed
    #[error("file {index}/{total} ({name}) failed: {source}")]
    FileFailed {
        index: usize,
        total: usize,
        name: String,
        #[source]
        source: Box<UploadError>,
    },

    /// A named step failed
    #[error("{step} failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<UploadError>,
    },

    /// The run was cancelled
    #[error("upload cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Build a backend failure for an operation
    pub fn backend(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with the step it happened in
    pub fn in_step(self, step: impl Into<String>) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, past every context wrapper
    pub fn root_cause(&self) -> &UploadError {
        match self {
            Self::PartFailed { source, .. }
            | Self::FileFailed { source, .. }
            | Self::Step { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Check if the root cause is a validation failure
    pub fn is_validation(&self) -> bool {
        match self.root_cause() {
            Self::Validation(_) => true,
            Self::Core(core) => core.is_validation(),
            _ => false,
        }
    }

    /// Check if the root cause is worth retrying at the part level
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::Network(_) | Self::Timeout(_) | Self::Http { .. }
        )
    }

    /// HTTP status of the root cause, if any
    pub fn status(&self) -> Option<u16> {
        match self.root_cause() {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Source chain below the top-level message, one cause per line
    pub fn detail(&self) -> Option<String> {
        let mut lines = Vec::new();
        let mut current = self.source();
        while let Some(err) = current {
            lines.push(err.to_string());
            current = err.source();
        }
        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UploadError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            UploadError::Http {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            UploadError::InvalidResponse(err.to_string())
        } else {
            UploadError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for UploadError {
    fn from(err: serde_json::Error) -> Self {
        UploadError::InvalidResponse(err.to_string())
    }
}
