//! Collaborator contracts: the record store and the object store

use crate::types::*;
use crate::Result;
use async_trait::async_trait;

/// Relational record API
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Log in and remember the session token
    async fn login(&self, email: &str, password: &str) -> Result<AuthSession>;

    /// End the current session
    async fn logout(&self) -> Result<()>;

    /// Check the current token and return its user
    async fn verify_token(&self) -> Result<UserProfile>;

    /// List client accounts visible to the user
    async fn get_clients(&self) -> Result<Vec<ClientAccount>>;

    /// Create a pending post record
    async fn create_post(&self, post: &NewPost) -> Result<PostId>;

    /// Delete a post record
    ///
    /// Contract: every media reference saved against the post is deleted with
    /// it. Rollback relies on this and never deletes references separately.
    async fn delete_post(&self, post_id: &PostId) -> Result<()>;

    /// Save media references for a post, returning how many were stored
    async fn save_media_refs(&self, post_id: &PostId, media: &[MediaRef]) -> Result<usize>;
}

/// Presigned-URL object storage API
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Presign a PUT for a whole object
    async fn generate_upload_url(&self, name: &str, mime_type: &str, size: u64) -> Result<PresignedUpload>;

    /// Check whether an object exists
    async fn verify_upload(&self, name: &str) -> Result<bool>;

    /// Delete objects
    async fn delete_files(&self, paths: &[String]) -> Result<()>;

    /// Join independently uploaded part objects, in order, into `name`
    async fn compose_parts(&self, name: &str, parts: &[String], mime_type: &str) -> Result<String>;

    /// Start a multipart upload, returning its upload ID
    async fn initiate_multipart_upload(&self, name: &str, mime_type: &str, size: u64) -> Result<String>;

    /// Presign the PUT for one part
    async fn get_multipart_part_url(&self, upload_id: &str, part_number: u32) -> Result<String>;

    /// Record the ETag of an uploaded part
    async fn register_multipart_part(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<()>;

    /// Assemble the registered parts, returning the public URL
    async fn complete_multipart_upload(&self, upload_id: &str) -> Result<String>;

    /// Discard a multipart upload and its parts
    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()>;
}
