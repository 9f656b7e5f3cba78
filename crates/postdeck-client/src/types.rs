//! Common types exchanged with the record and storage APIs

use chrono::{DateTime, Utc};
use postdeck_core::{MediaKind, PostType};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Identifier of a post record
///
/// Backends hand these out as numbers or strings; both deserialize.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PostId(pub String);

impl PostId {
    /// Create a post ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PostId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Text(String),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => PostId(n.to_string()),
            Raw::Text(s) => PostId(s),
        })
    }
}

/// Presigned destination for one object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedUpload {
    /// URL to PUT the bytes to
    pub upload_url: String,
    /// URL the object is served from afterwards
    pub public_url: String,
}

/// Authenticated user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    /// User ID
    pub id: String,
    /// Login email
    pub email: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Role (admin, designer, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Result of a login
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    /// Bearer token for later calls
    pub token: String,
    /// Who logged in
    pub user: UserProfile,
}

/// A client account posts are scheduled for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientAccount {
    /// Client ID
    pub id: String,
    /// Display name
    pub name: String,
    /// Social handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

/// Lifecycle of a post record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    /// Created, media not yet linked
    Pending,
    /// Ready to go out
    Scheduled,
}

/// Payload of a post record creation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPost {
    pub client_id: String,
    pub post_type: PostType,
    pub caption: String,
    pub scheduled_at: DateTime<Utc>,
    pub status: PostStatus,
}

/// Media reference saved against a post
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    /// Public URL of the object
    pub url: String,
    /// Object key in storage
    pub path: String,
    /// Position within the post, starting at 0
    pub order: u32,
    /// Image or video
    pub kind: MediaKind,
    /// MIME type
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
}
