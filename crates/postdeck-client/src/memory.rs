//! In-memory collaborators for testing and dry runs
//!
//! [`MemoryObjectStore`] is both the storage API and the storage service
//! behind its presigned URLs: it implements [`ObjectStore`] and accepts part
//! PUTs through [`PartUploader`]. [`MemoryRecordStore`] keeps posts and their
//! media references and honours the cascade-delete contract.
//!
//! Both record every call and can be told to fail specific operations.

use crate::types::*;
use crate::{ObjectStore, PartOutcome, PartRequest, PartUploader, RecordStore, Result, UploadError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const OBJECT_URL: &str = "memory://object/";
const PUBLIC_URL: &str = "memory://public/";
const MULTIPART_URL: &str = "memory://multipart/";

/// Shared call log and failure switches
#[derive(Default)]
struct Ledger {
    calls: Mutex<Vec<String>>,
    failing: DashMap<String, String>,
}

impl Ledger {
    fn enter(&self, operation: &str) -> Result<()> {
        self.calls.lock().push(operation.to_string());
        match self.failing.get(operation) {
            Some(message) => Err(UploadError::backend(operation, message.value().clone())),
            None => Ok(()),
        }
    }

    fn count(&self, operation: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == operation).count()
    }
}

/// A rule that makes matching part PUTs fail
#[derive(Clone, Debug)]
struct PutFailure {
    url_contains: String,
    /// Remaining failures; `None` fails forever
    remaining: Option<u32>,
    status: u16,
}

#[derive(Debug, Default)]
struct MultipartUpload {
    name: String,
    staged: BTreeMap<u32, (String, Bytes)>,
    registered: BTreeMap<u32, String>,
}

/// RAII guard for the in-flight PUT counter
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize, peak: &AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ObjectInner {
    objects: DashMap<String, Bytes>,
    uploads: DashMap<String, MultipartUpload>,
    hidden: DashSet<String>,
    deleted: Mutex<Vec<String>>,
    aborted: Mutex<Vec<String>>,
    ledger: Ledger,
    put_failures: Mutex<Vec<PutFailure>>,
    put_attempts: Mutex<Vec<String>>,
    put_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    next_upload: AtomicU64,
}

/// An in-memory object store
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    inner: Arc<ObjectInner>,
}

impl MemoryObjectStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` fail with a backend error
    pub fn fail_operation(&self, operation: &str, message: &str) {
        self.inner
            .ledger
            .failing
            .insert(operation.to_string(), message.to_string());
    }

    /// Let `operation` succeed again
    pub fn clear_failure(&self, operation: &str) {
        self.inner.ledger.failing.remove(operation);
    }

    /// Fail the next `times` PUTs whose URL contains `url_contains`
    pub fn fail_puts(&self, url_contains: &str, times: u32, status: u16) {
        self.inner.put_failures.lock().push(PutFailure {
            url_contains: url_contains.to_string(),
            remaining: Some(times),
            status,
        });
    }

    /// Fail every PUT whose URL contains `url_contains`
    pub fn fail_puts_always(&self, url_contains: &str, status: u16) {
        self.inner.put_failures.lock().push(PutFailure {
            url_contains: url_contains.to_string(),
            remaining: None,
            status,
        });
    }

    /// Delay every PUT
    pub fn set_put_delay(&self, delay: Duration) {
        *self.inner.put_delay.lock() = delay;
    }

    /// Report `name` as missing from verification even though it was written
    pub fn hide_object(&self, name: &str) {
        self.inner.hidden.insert(name.to_string());
    }

    /// Insert an object directly
    pub fn insert_object(&self, name: &str, data: impl Into<Bytes>) {
        self.inner.objects.insert(name.to_string(), data.into());
    }

    /// Get an object's bytes
    pub fn object(&self, name: &str) -> Option<Bytes> {
        self.inner.objects.get(name).map(|entry| entry.value().clone())
    }

    /// Check if an object exists
    pub fn contains(&self, name: &str) -> bool {
        self.inner.objects.contains_key(name)
    }

    /// List object names, sorted
    pub fn object_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.objects.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Paths passed to `delete_files`, in call order
    pub fn deleted_paths(&self) -> Vec<String> {
        self.inner.deleted.lock().clone()
    }

    /// Upload IDs that were aborted
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.inner.aborted.lock().clone()
    }

    /// Multipart uploads neither completed nor aborted
    pub fn open_uploads(&self) -> usize {
        self.inner.uploads.len()
    }

    /// Parts registered against an open upload, in part order
    pub fn registered_parts(&self, upload_id: &str) -> Vec<(u32, String)> {
        self.inner
            .uploads
            .get(upload_id)
            .map(|u| u.registered.iter().map(|(n, e)| (*n, e.clone())).collect())
            .unwrap_or_default()
    }

    /// Storage API calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.inner.ledger.calls.lock().clone()
    }

    /// Number of calls to `operation`
    pub fn call_count(&self, operation: &str) -> usize {
        self.inner.ledger.count(operation)
    }

    /// URLs of every PUT attempt, in order
    pub fn put_attempts(&self) -> Vec<String> {
        self.inner.put_attempts.lock().clone()
    }

    /// Number of PUT attempts against URLs containing `url_contains`
    pub fn put_attempts_matching(&self, url_contains: &str) -> usize {
        self.inner
            .put_attempts
            .lock()
            .iter()
            .filter(|u| u.contains(url_contains))
            .count()
    }

    /// Highest number of PUTs in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    fn public_url(name: &str) -> String {
        format!("{PUBLIC_URL}{name}")
    }

    fn injected_failure(&self, url: &str) -> Option<u16> {
        let mut rules = self.inner.put_failures.lock();
        for rule in rules.iter_mut() {
            if !url.contains(&rule.url_contains) {
                continue;
            }
            match rule.remaining.as_mut() {
                None => return Some(rule.status),
                Some(0) => continue,
                Some(n) => {
                    *n -= 1;
                    return Some(rule.status);
                }
            }
        }
        None
    }

    fn accept_put(&self, request: &PartRequest) -> Result<Option<String>> {
        if let Some(name) = request.url.strip_prefix(OBJECT_URL) {
            let body = match request.content_range {
                Some(range) => {
                    let mut buf = BytesMut::from(self.object(name).unwrap_or_default().as_ref());
                    buf.resize(buf.len().max(range.total as usize), 0);
                    buf[range.start as usize..range.end as usize].copy_from_slice(&request.body);
                    buf.freeze()
                }
                None => request.body.clone(),
            };
            self.inner.objects.insert(name.to_string(), body);
            return Ok(None);
        }

        if let Some(rest) = request.url.strip_prefix(MULTIPART_URL) {
            let (upload_id, part) = rest
                .split_once('/')
                .ok_or_else(|| UploadError::Http {
                    status: 400,
                    message: format!("malformed part URL {}", request.url),
                })?;
            let part_number: u32 = part.parse().map_err(|_| UploadError::Http {
                status: 400,
                message: format!("malformed part number in {}", request.url),
            })?;
            let mut upload = self.inner.uploads.get_mut(upload_id).ok_or_else(|| UploadError::Http {
                status: 404,
                message: format!("no such upload {upload_id}"),
            })?;
            let etag = format!("etag-{upload_id}-{part_number}");
            upload
                .staged
                .insert(part_number, (etag.clone(), request.body.clone()));
            return Ok(Some(etag));
        }

        Err(UploadError::Http {
            status: 404,
            message: format!("unknown URL {}", request.url),
        })
    }
}

#[async_trait]
impl PartUploader for MemoryObjectStore {
    async fn upload(&self, request: &PartRequest) -> Result<PartOutcome> {
        let started = Instant::now();
        self.inner.put_attempts.lock().push(request.url.clone());
        let _guard = InFlight::enter(&self.inner.in_flight, &self.inner.peak_in_flight);

        let delay = *self.inner.put_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if let Some(status) = self.injected_failure(&request.url) {
            return Err(UploadError::Http {
                status,
                message: "injected failure".to_string(),
            });
        }

        let etag = self.accept_put(request)?;
        Ok(PartOutcome {
            etag,
            elapsed: started.elapsed(),
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn generate_upload_url(&self, name: &str, _mime_type: &str, _size: u64) -> Result<PresignedUpload> {
        self.inner.ledger.enter("generate_upload_url")?;
        Ok(PresignedUpload {
            upload_url: format!("{OBJECT_URL}{name}"),
            public_url: Self::public_url(name),
        })
    }

    async fn verify_upload(&self, name: &str) -> Result<bool> {
        self.inner.ledger.enter("verify_upload")?;
        Ok(self.contains(name) && !self.inner.hidden.contains(name))
    }

    async fn delete_files(&self, paths: &[String]) -> Result<()> {
        self.inner.ledger.enter("delete_files")?;
        for path in paths {
            self.inner.objects.remove(path);
            self.inner.deleted.lock().push(path.clone());
        }
        Ok(())
    }

    async fn compose_parts(&self, name: &str, parts: &[String], _mime_type: &str) -> Result<String> {
        self.inner.ledger.enter("compose_parts")?;
        let mut joined = BytesMut::new();
        for part in parts {
            let data = self
                .object(part)
                .ok_or_else(|| UploadError::backend("compose_parts", format!("missing part object {part}")))?;
            joined.extend_from_slice(&data);
        }
        self.inner.objects.insert(name.to_string(), joined.freeze());
        for part in parts {
            self.inner.objects.remove(part);
        }
        Ok(Self::public_url(name))
    }

    async fn initiate_multipart_upload(&self, name: &str, _mime_type: &str, _size: u64) -> Result<String> {
        self.inner.ledger.enter("initiate_multipart_upload")?;
        let upload_id = format!("mpu-{}", self.inner.next_upload.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.uploads.insert(
            upload_id.clone(),
            MultipartUpload {
                name: name.to_string(),
                ..Default::default()
            },
        );
        Ok(upload_id)
    }

    async fn get_multipart_part_url(&self, upload_id: &str, part_number: u32) -> Result<String> {
        self.inner.ledger.enter("get_multipart_part_url")?;
        if !self.inner.uploads.contains_key(upload_id) {
            return Err(UploadError::backend("get_multipart_part_url", format!("no such upload {upload_id}")));
        }
        Ok(format!("{MULTIPART_URL}{upload_id}/{part_number}"))
    }

    async fn register_multipart_part(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<()> {
        self.inner.ledger.enter("register_multipart_part")?;
        let mut upload = self
            .inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::backend("register_multipart_part", format!("no such upload {upload_id}")))?;
        match upload.staged.get(&part_number) {
            Some((staged, _)) if staged == etag => {}
            _ => {
                return Err(UploadError::backend(
                    "register_multipart_part",
                    format!("part {part_number} has no upload with etag {etag}"),
                ))
            }
        }
        if upload.registered.insert(part_number, etag.to_string()).is_some() {
            return Err(UploadError::backend(
                "register_multipart_part",
                format!("part {part_number} registered twice"),
            ));
        }
        Ok(())
    }

    async fn complete_multipart_upload(&self, upload_id: &str) -> Result<String> {
        self.inner.ledger.enter("complete_multipart_upload")?;
        let (_, upload) = self
            .inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| UploadError::backend("complete_multipart_upload", format!("no such upload {upload_id}")))?;

        let contiguous = upload.registered.keys().copied().eq(1..=upload.registered.len() as u32);
        if upload.registered.is_empty() || !contiguous {
            let name = upload.name.clone();
            self.inner.uploads.insert(upload_id.to_string(), upload);
            return Err(UploadError::backend(
                "complete_multipart_upload",
                format!("registered parts of {name} are not contiguous"),
            ));
        }

        let mut joined = BytesMut::new();
        for part_number in upload.registered.keys() {
            if let Some((_, data)) = upload.staged.get(part_number) {
                joined.extend_from_slice(data);
            }
        }
        self.inner.objects.insert(upload.name.clone(), joined.freeze());
        Ok(Self::public_url(&upload.name))
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        self.inner.ledger.enter("abort_multipart_upload")?;
        self.inner.uploads.remove(upload_id);
        self.inner.aborted.lock().push(upload_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordInner {
    posts: DashMap<String, NewPost>,
    media: DashMap<String, Vec<MediaRef>>,
    clients: Mutex<Vec<ClientAccount>>,
    user: Mutex<Option<(String, UserProfile)>>,
    token: Mutex<Option<String>>,
    next_post_id: AtomicU64,
    short_save: AtomicUsize,
    ledger: Ledger,
}

/// An in-memory record store
#[derive(Clone)]
pub struct MemoryRecordStore {
    inner: Arc<RecordInner>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    /// Create a store whose first post gets ID 1
    pub fn new() -> Self {
        let inner = RecordInner {
            next_post_id: AtomicU64::new(1),
            ..Default::default()
        };
        Self { inner: Arc::new(inner) }
    }

    /// Set the ID the next created post gets
    pub fn with_next_post_id(self, id: u64) -> Self {
        self.inner.next_post_id.store(id, Ordering::SeqCst);
        self
    }

    /// Add a client account
    pub fn with_client(self, id: &str, name: &str) -> Self {
        self.inner.clients.lock().push(ClientAccount {
            id: id.to_string(),
            name: name.to_string(),
            handle: None,
        });
        self
    }

    /// Accept logins for `email` / `password`
    pub fn with_user(self, email: &str, password: &str) -> Self {
        *self.inner.user.lock() = Some((
            password.to_string(),
            UserProfile {
                id: "user-1".to_string(),
                email: email.to_string(),
                name: None,
                role: Some("admin".to_string()),
            },
        ));
        self
    }

    /// Make `operation` fail with a backend error
    pub fn fail_operation(&self, operation: &str, message: &str) {
        self.inner
            .ledger
            .failing
            .insert(operation.to_string(), message.to_string());
    }

    /// Report `missing` fewer saved media references than were sent
    pub fn under_report_saves(&self, missing: usize) {
        self.inner.short_save.store(missing, Ordering::SeqCst);
    }

    /// Get a post record
    pub fn post(&self, id: &PostId) -> Option<NewPost> {
        self.inner.posts.get(id.as_str()).map(|e| e.value().clone())
    }

    /// Number of post records
    pub fn post_count(&self) -> usize {
        self.inner.posts.len()
    }

    /// Media references saved against a post
    pub fn media_refs(&self, id: &PostId) -> Vec<MediaRef> {
        self.inner
            .media
            .get(id.as_str())
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Record API calls, in order
    pub fn calls(&self) -> Vec<String> {
        self.inner.ledger.calls.lock().clone()
    }

    /// Number of calls to `operation`
    pub fn call_count(&self, operation: &str) -> usize {
        self.inner.ledger.count(operation)
    }

    /// Token of the current session
    pub fn token(&self) -> Option<String> {
        self.inner.token.lock().clone()
    }

    fn unauthorized() -> UploadError {
        UploadError::Http {
            status: 401,
            message: "not logged in".to_string(),
        }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        self.inner.ledger.enter("login")?;
        let user = match &*self.inner.user.lock() {
            Some((expected, user)) if user.email == email && expected == password => user.clone(),
            _ => return Err(UploadError::backend("login", "invalid email or password")),
        };
        let token = format!("memory-token-{}", user.id);
        *self.inner.token.lock() = Some(token.clone());
        Ok(AuthSession { token, user })
    }

    async fn logout(&self) -> Result<()> {
        self.inner.ledger.enter("logout")?;
        *self.inner.token.lock() = None;
        Ok(())
    }

    async fn verify_token(&self) -> Result<UserProfile> {
        self.inner.ledger.enter("verify_token")?;
        if self.inner.token.lock().is_none() {
            return Err(Self::unauthorized());
        }
        self.inner
            .user
            .lock()
            .as_ref()
            .map(|(_, user)| user.clone())
            .ok_or_else(Self::unauthorized)
    }

    async fn get_clients(&self) -> Result<Vec<ClientAccount>> {
        self.inner.ledger.enter("get_clients")?;
        Ok(self.inner.clients.lock().clone())
    }

    async fn create_post(&self, post: &NewPost) -> Result<PostId> {
        self.inner.ledger.enter("create_post")?;
        let id = PostId::new(self.inner.next_post_id.fetch_add(1, Ordering::SeqCst).to_string());
        self.inner.posts.insert(id.0.clone(), post.clone());
        Ok(id)
    }

    async fn delete_post(&self, post_id: &PostId) -> Result<()> {
        self.inner.ledger.enter("delete_post")?;
        if self.inner.posts.remove(post_id.as_str()).is_none() {
            return Err(UploadError::backend("delete_post", format!("post {post_id} not found")));
        }
        self.inner.media.remove(post_id.as_str());
        Ok(())
    }

    async fn save_media_refs(&self, post_id: &PostId, media: &[MediaRef]) -> Result<usize> {
        self.inner.ledger.enter("save_media_refs")?;
        if !self.inner.posts.contains_key(post_id.as_str()) {
            return Err(UploadError::backend("save_media_refs", format!("post {post_id} not found")));
        }
        self.inner
            .media
            .entry(post_id.0.clone())
            .or_default()
            .extend_from_slice(media);
        let short = self.inner.short_save.load(Ordering::SeqCst);
        Ok(media.len().saturating_sub(short))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use postdeck_core::{MediaKind, PostType};

    fn put(url: &str, body: &'static [u8]) -> PartRequest {
        PartRequest {
            url: url.to_string(),
            body: Bytes::from_static(body),
            content_type: "video/mp4".to_string(),
            content_range: None,
            timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_presigned_put_then_verify() {
        let store = MemoryObjectStore::new();
        let presigned = store.generate_upload_url("a.jpg", "image/jpeg", 3).await.unwrap();
        assert!(!store.verify_upload("a.jpg").await.unwrap());

        store.upload(&put(&presigned.upload_url, b"abc")).await.unwrap();
        assert!(store.verify_upload("a.jpg").await.unwrap());
        assert_eq!(store.object("a.jpg").unwrap(), Bytes::from_static(b"abc"));

        store.hide_object("a.jpg");
        assert!(!store.verify_upload("a.jpg").await.unwrap());
    }

    #[tokio::test]
    async fn test_compose_joins_in_order_and_drops_parts() {
        let store = MemoryObjectStore::new();
        store.insert_object("v.mp4.part1", "ab");
        store.insert_object("v.mp4.part2", "cd");

        let url = store
            .compose_parts("v.mp4", &["v.mp4.part1".to_string(), "v.mp4.part2".to_string()], "video/mp4")
            .await
            .unwrap();

        assert_eq!(url, "memory://public/v.mp4");
        assert_eq!(store.object("v.mp4").unwrap(), Bytes::from_static(b"abcd"));
        assert_eq!(store.object_names(), vec!["v.mp4".to_string()]);
    }

    #[tokio::test]
    async fn test_multipart_requires_registered_contiguous_parts() {
        let store = MemoryObjectStore::new();
        let id = store.initiate_multipart_upload("big.mp4", "video/mp4", 4).await.unwrap();

        let url2 = store.get_multipart_part_url(&id, 2).await.unwrap();
        let out2 = store.upload(&put(&url2, b"cd")).await.unwrap();
        store
            .register_multipart_part(&id, 2, out2.etag.as_deref().unwrap())
            .await
            .unwrap();

        // part 1 missing
        assert!(store.complete_multipart_upload(&id).await.is_err());
        assert_eq!(store.open_uploads(), 1);

        let url1 = store.get_multipart_part_url(&id, 1).await.unwrap();
        let out1 = store.upload(&put(&url1, b"ab")).await.unwrap();
        assert!(store.register_multipart_part(&id, 1, "wrong").await.is_err());
        store
            .register_multipart_part(&id, 1, out1.etag.as_deref().unwrap())
            .await
            .unwrap();

        store.complete_multipart_upload(&id).await.unwrap();
        assert_eq!(store.object("big.mp4").unwrap(), Bytes::from_static(b"abcd"));
        // never twice
        assert!(store.complete_multipart_upload(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_put_failure_rules() {
        let store = MemoryObjectStore::new();
        store.fail_puts("x.part2", 1, 503);

        let err = store.upload(&put("memory://object/x.part2", b"z")).await.unwrap_err();
        assert_eq!(err.status(), Some(503));
        store.upload(&put("memory://object/x.part2", b"z")).await.unwrap();
        assert_eq!(store.put_attempts_matching("x.part2"), 2);
    }

    #[tokio::test]
    async fn test_operation_failures_are_backend_errors() {
        let store = MemoryObjectStore::new();
        store.fail_operation("delete_files", "bucket locked");
        let err = store.delete_files(&["a".to_string()]).await.unwrap_err();
        assert_eq!(err.to_string(), "delete_files failed: bucket locked");
        assert_eq!(store.call_count("delete_files"), 1);
    }

    #[tokio::test]
    async fn test_delete_post_cascades_to_media_refs() {
        let records = MemoryRecordStore::new().with_next_post_id(42);
        let id = records
            .create_post(&NewPost {
                client_id: "c1".to_string(),
                post_type: PostType::Single,
                caption: "hi".to_string(),
                scheduled_at: Utc::now(),
                status: PostStatus::Pending,
            })
            .await
            .unwrap();
        assert_eq!(id, PostId::new("42"));

        let saved = records
            .save_media_refs(
                &id,
                &[MediaRef {
                    url: "u".to_string(),
                    path: "p".to_string(),
                    order: 0,
                    kind: MediaKind::Image,
                    mime_type: "image/png".to_string(),
                    size: 1,
                }],
            )
            .await
            .unwrap();
        assert_eq!(saved, 1);
        assert_eq!(records.media_refs(&id).len(), 1);

        records.delete_post(&id).await.unwrap();
        assert!(records.post(&id).is_none());
        assert!(records.media_refs(&id).is_empty());
    }

    #[tokio::test]
    async fn test_login_and_verify() {
        let records = MemoryRecordStore::new().with_user("ana@example.com", "pw");
        assert_eq!(records.verify_token().await.unwrap_err().status(), Some(401));
        assert!(records.login("ana@example.com", "nope").await.is_err());

        let session = records.login("ana@example.com", "pw").await.unwrap();
        assert_eq!(records.verify_token().await.unwrap(), session.user);

        records.logout().await.unwrap();
        assert!(records.token().is_none());
    }
}
