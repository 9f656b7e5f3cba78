//! Scheduled post drafts

use crate::{MediaBlob, ValidationError, MAX_CAPTION_CHARS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of post being scheduled
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostType {
    Single,
    Carousel,
    Reel,
    Story,
}

impl PostType {
    /// Minimum number of media files this post type needs
    pub fn min_media(&self) -> usize {
        match self {
            Self::Carousel => 2,
            _ => 1,
        }
    }

    /// Wire name of the post type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Carousel => "carousel",
            Self::Reel => "reel",
            Self::Story => "story",
        }
    }
}

impl fmt::Display for PostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "single" | "post" => Ok(Self::Single),
            "carousel" => Ok(Self::Carousel),
            "reel" => Ok(Self::Reel),
            "story" => Ok(Self::Story),
            other => Err(ValidationError::new(
                "post_type",
                format!("unknown post type {other}"),
            )),
        }
    }
}

/// Everything the user filled in for a scheduled post
#[derive(Clone, Debug, Default)]
pub struct PostDraft {
    /// Client account the post belongs to
    pub client_id: Option<String>,
    /// Kind of post
    pub post_type: Option<PostType>,
    /// Caption text
    pub caption: String,
    /// When the post should go out
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Media files in display order
    pub media: Vec<MediaBlob>,
}

impl PostDraft {
    /// Total size of all media
    pub fn total_bytes(&self) -> u64 {
        self.media.iter().map(MediaBlob::size).sum()
    }

    /// Check the draft against `now`; runs before any side effect
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        match self.client_id.as_deref() {
            Some(id) if !id.trim().is_empty() => {}
            _ => return Err(ValidationError::new("client", "select a client")),
        }

        let post_type = self
            .post_type
            .ok_or_else(|| ValidationError::new("post_type", "select a post type"))?;

        if self.media.is_empty() {
            return Err(ValidationError::new("media", "add at least one media file"));
        }
        if self.media.len() < post_type.min_media() {
            return Err(ValidationError::new(
                "media",
                format!(
                    "a {} post needs at least {} files, got {}",
                    post_type,
                    post_type.min_media(),
                    self.media.len()
                ),
            ));
        }

        match self.scheduled_at {
            Some(at) if at > now => {}
            Some(_) => {
                return Err(ValidationError::new(
                    "scheduled_at",
                    "schedule time must be in the future",
                ))
            }
            None => return Err(ValidationError::new("scheduled_at", "pick a schedule time")),
        }

        let caption_len = self.caption.chars().count();
        if caption_len > MAX_CAPTION_CHARS {
            return Err(ValidationError::new(
                "caption",
                format!("caption is {caption_len} characters, limit is {MAX_CAPTION_CHARS}"),
            ));
        }

        for blob in &self.media {
            blob.validate()?;
        }

        Ok(())
    }
}
