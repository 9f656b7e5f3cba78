//! Error types for the postdeck-core crate

use thiserror::Error;

/// Result type alias using `CoreError`
pub type Result<T> = std::result::Result<T, CoreError>;

/// A rejected input, reported before any side effect happens
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Which input was rejected
    pub field: &'static str,
    /// Human-readable reason
    pub message: String,
}

impl ValidationError {
    /// Create a validation error for a field
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Errors raised by the domain model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Input failed validation
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Chunk size must be positive
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(u64),

    /// A part number outside the session's range was recorded
    #[error("part {part_number} is outside 1..={total_parts}")]
    UnknownPart { part_number: u32, total_parts: u32 },

    /// The same part was recorded twice
    #[error("part {0} was registered more than once")]
    DuplicatePart(u32),

    /// Parts are missing when the session is finalized
    #[error("missing parts: {missing:?}")]
    MissingParts { missing: Vec<u32> },

    /// The multipart lifecycle was driven out of order
    #[error("invalid multipart transition from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
}

impl CoreError {
    /// Check if this is a validation failure
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}
