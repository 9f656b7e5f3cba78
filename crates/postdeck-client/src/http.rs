//! HTTP implementations of the record and object stores
//!
//! Both APIs speak JSON. Responses may be wrapped in an envelope
//! (`{"success": true, "data": ...}`); a `success: false` or a non-null
//! `error` field is reported as [`UploadError::Backend`].

use crate::types::*;
use crate::{ClientConfig, ObjectStore, RecordStore, Result, UploadError};
use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, instrument};
use url::Url;

/// Bearer token shared by every client of one login session
#[derive(Clone, Debug, Default)]
pub struct SessionToken(Arc<RwLock<Option<String>>>);

impl SessionToken {
    pub fn new(token: Option<String>) -> Self {
        Self(Arc::new(RwLock::new(token)))
    }

    pub fn get(&self) -> Option<String> {
        self.0.read().clone()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.0.write() = Some(token.into());
    }

    pub fn clear(&self) {
        *self.0.write() = None;
    }
}

/// JSON API client rooted at one endpoint
#[derive(Clone)]
pub struct ApiClient {
    base: Url,
    http: Client,
    token: SessionToken,
}

impl ApiClient {
    /// Create a client for `endpoint`
    pub fn new(endpoint: &str, config: &ClientConfig, token: SessionToken) -> Result<Self> {
        let mut base = Url::parse(endpoint)
            .map_err(|e| UploadError::Config(format!("invalid endpoint {endpoint}: {e}")))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::USER_AGENT,
            header::HeaderValue::from_str(&config.user_agent)
                .map_err(|e| UploadError::Config(format!("invalid user agent: {e}")))?,
        );

        let http = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| UploadError::Config(e.to_string()))?;

        Ok(Self { base, http, token })
    }

    /// Get the endpoint
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Get the session token
    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    /// Send a request and decode the payload
    pub async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T> {
        let payload = self.send(operation, method, path, body).await?;
        serde_json::from_value(payload)
            .map_err(|e| UploadError::InvalidResponse(format!("{operation}: {e}")))
    }

    /// Send a request whose payload is not needed
    pub async fn call_unit(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<()> {
        self.send(operation, method, path, body).await.map(|_| ())
    }

    async fn send(&self, operation: &str, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let url = self
            .base
            .join(path.trim_start_matches('/'))
            .map_err(|e| UploadError::Config(format!("invalid path {path}: {e}")))?;

        let request_id = uuid::Uuid::new_v4().to_string();
        let mut req = self
            .http
            .request(method.clone(), url.clone())
            .header("x-request-id", &request_id);
        if let Some(token) = self.token.get() {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(&body);
        }

        debug!(request_id = %request_id, "Sending {} request to {}", method, url);
        let response = req.send().await?;

        let status = response.status();
        let text = response.text().await?;
        let value: Value = if text.trim().is_empty() {
            Value::Null
        } else if status.is_success() {
            serde_json::from_str(&text)?
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            return Err(UploadError::Http {
                status: status.as_u16(),
                message: error_message(&value).unwrap_or_else(|| status.to_string()),
            });
        }

        unwrap_envelope(operation, value)
    }
}

fn error_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(map) => ["error", "message"]
            .iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

fn unwrap_envelope(operation: &str, value: Value) -> Result<Value> {
    let mut map = match value {
        Value::Object(map) => map,
        other => return Ok(other),
    };

    let failed = map.get("success") == Some(&Value::Bool(false))
        || map.get("error").is_some_and(|e| !e.is_null());
    if failed {
        let message = error_message(&Value::Object(map)).unwrap_or_else(|| "request failed".to_string());
        return Err(UploadError::backend(operation, message));
    }

    match map.remove("data") {
        Some(data) => Ok(data),
        None => Ok(Value::Object(map)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedPost {
    #[serde(alias = "postId")]
    id: PostId,
}

#[derive(Deserialize)]
struct SavedCount {
    count: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UserPayload {
    Wrapped { user: UserProfile },
    Bare(UserProfile),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ClientsPayload {
    Wrapped { clients: Vec<ClientAccount> },
    Bare(Vec<ClientAccount>),
}

#[derive(Deserialize)]
struct Exists {
    exists: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicUrl {
    public_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadId {
    upload_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartUrl {
    #[serde(alias = "url")]
    upload_url: String,
}

/// Record store over HTTP
#[derive(Clone)]
pub struct HttpRecordStore {
    api: ApiClient,
}

impl HttpRecordStore {
    /// Create a store on the config's API endpoint
    pub fn new(config: &ClientConfig, token: SessionToken) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(&config.api_endpoint, config, token)?,
        })
    }

    /// Get the session token
    pub fn token(&self) -> &SessionToken {
        self.api.token()
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    // ==================== Session ====================

    #[instrument(skip(self, password))]
    async fn login(&self, email: &str, password: &str) -> Result<AuthSession> {
        let session: AuthSession = self
            .api
            .call(
                "login",
                Method::POST,
                "auth/login",
                Some(json!({ "email": email, "password": password })),
            )
            .await?;
        self.api.token().set(session.token.clone());
        Ok(session)
    }

    #[instrument(skip(self))]
    async fn logout(&self) -> Result<()> {
        let result = self.api.call_unit("logout", Method::POST, "auth/logout", None).await;
        self.api.token().clear();
        result
    }

    #[instrument(skip(self))]
    async fn verify_token(&self) -> Result<UserProfile> {
        let payload: UserPayload = self
            .api
            .call("verify_token", Method::GET, "auth/verify", None)
            .await?;
        Ok(match payload {
            UserPayload::Wrapped { user } => user,
            UserPayload::Bare(user) => user,
        })
    }

    // ==================== Records ====================

    #[instrument(skip(self))]
    async fn get_clients(&self) -> Result<Vec<ClientAccount>> {
        let payload: ClientsPayload = self.api.call("get_clients", Method::GET, "clients", None).await?;
        Ok(match payload {
            ClientsPayload::Wrapped { clients } => clients,
            ClientsPayload::Bare(clients) => clients,
        })
    }

    #[instrument(skip(self, post), fields(client = %post.client_id))]
    async fn create_post(&self, post: &NewPost) -> Result<PostId> {
        let created: CreatedPost = self
            .api
            .call("create_post", Method::POST, "posts", Some(serde_json::to_value(post)?))
            .await?;
        Ok(created.id)
    }

    #[instrument(skip(self))]
    async fn delete_post(&self, post_id: &PostId) -> Result<()> {
        self.api
            .call_unit("delete_post", Method::DELETE, &format!("posts/{post_id}"), None)
            .await
    }

    #[instrument(skip(self, media), fields(count = media.len()))]
    async fn save_media_refs(&self, post_id: &PostId, media: &[MediaRef]) -> Result<usize> {
        let saved: SavedCount = self
            .api
            .call(
                "save_media_refs",
                Method::POST,
                &format!("posts/{post_id}/media"),
                Some(json!({ "media": media })),
            )
            .await?;
        Ok(saved.count)
    }
}

/// Object store over HTTP
#[derive(Clone)]
pub struct HttpObjectStore {
    api: ApiClient,
}

impl HttpObjectStore {
    /// Create a store on the config's storage endpoint
    pub fn new(config: &ClientConfig, token: SessionToken) -> Result<Self> {
        Ok(Self {
            api: ApiClient::new(&config.storage_endpoint, config, token)?,
        })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    // ==================== Objects ====================

    #[instrument(skip(self))]
    async fn generate_upload_url(&self, name: &str, mime_type: &str, size: u64) -> Result<PresignedUpload> {
        self.api
            .call(
                "generate_upload_url",
                Method::POST,
                "uploads/url",
                Some(json!({ "fileName": name, "mimeType": mime_type, "size": size })),
            )
            .await
    }

    #[instrument(skip(self))]
    async fn verify_upload(&self, name: &str) -> Result<bool> {
        let exists: Exists = self
            .api
            .call(
                "verify_upload",
                Method::POST,
                "uploads/verify",
                Some(json!({ "fileName": name })),
            )
            .await?;
        Ok(exists.exists)
    }

    #[instrument(skip(self, paths), fields(count = paths.len()))]
    async fn delete_files(&self, paths: &[String]) -> Result<()> {
        self.api
            .call_unit(
                "delete_files",
                Method::POST,
                "uploads/delete",
                Some(json!({ "paths": paths })),
            )
            .await
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()))]
    async fn compose_parts(&self, name: &str, parts: &[String], mime_type: &str) -> Result<String> {
        let composed: PublicUrl = self
            .api
            .call(
                "compose_parts",
                Method::POST,
                "uploads/compose",
                Some(json!({ "fileName": name, "parts": parts, "mimeType": mime_type })),
            )
            .await?;
        Ok(composed.public_url)
    }

    // ==================== Multipart ====================

    #[instrument(skip(self))]
    async fn initiate_multipart_upload(&self, name: &str, mime_type: &str, size: u64) -> Result<String> {
        let initiated: UploadId = self
            .api
            .call(
                "initiate_multipart_upload",
                Method::POST,
                "multipart/initiate",
                Some(json!({ "fileName": name, "mimeType": mime_type, "size": size })),
            )
            .await?;
        Ok(initiated.upload_id)
    }

    #[instrument(skip(self))]
    async fn get_multipart_part_url(&self, upload_id: &str, part_number: u32) -> Result<String> {
        let part: PartUrl = self
            .api
            .call(
                "get_multipart_part_url",
                Method::POST,
                "multipart/part-url",
                Some(json!({ "uploadId": upload_id, "partNumber": part_number })),
            )
            .await?;
        Ok(part.upload_url)
    }

    #[instrument(skip(self))]
    async fn register_multipart_part(&self, upload_id: &str, part_number: u32, etag: &str) -> Result<()> {
        self.api
            .call_unit(
                "register_multipart_part",
                Method::POST,
                "multipart/register-part",
                Some(json!({ "uploadId": upload_id, "partNumber": part_number, "etag": etag })),
            )
            .await
    }

    #[instrument(skip(self))]
    async fn complete_multipart_upload(&self, upload_id: &str) -> Result<String> {
        let completed: PublicUrl = self
            .api
            .call(
                "complete_multipart_upload",
                Method::POST,
                "multipart/complete",
                Some(json!({ "uploadId": upload_id })),
            )
            .await?;
        Ok(completed.public_url)
    }

    #[instrument(skip(self))]
    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        self.api
            .call_unit(
                "abort_multipart_upload",
                Method::POST,
                "multipart/abort",
                Some(json!({ "uploadId": upload_id })),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use postdeck_core::PostType;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ClientConfig {
        ClientConfig::new(format!("{}/api", server.uri()), format!("{}/storage", server.uri()))
    }

    #[tokio::test]
    async fn test_login_token_is_sent_afterwards() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(body_partial_json(json!({ "email": "ana@example.com" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "token": "tok-1", "user": { "id": "u1", "email": "ana@example.com" } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/clients"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "clients": [{ "id": "c1", "name": "Acme" }]
            })))
            .mount(&server)
            .await;

        let store = HttpRecordStore::new(&config(&server), SessionToken::default()).unwrap();
        let session = store.login("ana@example.com", "pw").await.unwrap();
        assert_eq!(session.user.id, "u1");
        assert_eq!(store.token().get().as_deref(), Some("tok-1"));

        let clients = store.get_clients().await.unwrap();
        assert_eq!(clients[0].name, "Acme");
    }

    #[tokio::test]
    async fn test_failure_envelope_is_backend_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/posts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "error": "client is archived"
            })))
            .mount(&server)
            .await;

        let store = HttpRecordStore::new(&config(&server), SessionToken::new(Some("t".into()))).unwrap();
        let err = store
            .create_post(&NewPost {
                client_id: "c1".to_string(),
                post_type: PostType::Single,
                caption: String::new(),
                scheduled_at: Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap(),
                status: PostStatus::Pending,
            })
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "create_post failed: client is archived");
    }

    #[tokio::test]
    async fn test_numeric_post_id_and_cascade_delete_route() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/posts"))
            .and(body_partial_json(json!({ "postType": "carousel", "status": "pending" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "postId": 42 })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/posts/42"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpRecordStore::new(&config(&server), SessionToken::default()).unwrap();
        let id = store
            .create_post(&NewPost {
                client_id: "c1".to_string(),
                post_type: PostType::Carousel,
                caption: "x".to_string(),
                scheduled_at: Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap(),
                status: PostStatus::Pending,
            })
            .await
            .unwrap();
        assert_eq!(id, PostId::new("42"));
        store.delete_post(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_keeps_status_and_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/uploads/verify"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({ "error": "expired token" })))
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(&config(&server), SessionToken::default()).unwrap();
        let err = store.verify_upload("a.jpg").await.unwrap_err();
        assert_eq!(err.status(), Some(403));
        assert!(err.to_string().contains("expired token"));
    }

    #[tokio::test]
    async fn test_multipart_round() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/storage/multipart/initiate"))
            .and(body_partial_json(json!({ "fileName": "v.mp4", "size": 10 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadId": "up-9" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/multipart/part-url"))
            .and(body_partial_json(json!({ "uploadId": "up-9", "partNumber": 2 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "uploadUrl": "https://r2/p2" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/multipart/register-part"))
            .and(body_partial_json(json!({ "uploadId": "up-9", "partNumber": 2, "etag": "e2" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/storage/multipart/abort"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = HttpObjectStore::new(&config(&server), SessionToken::default()).unwrap();
        let id = store.initiate_multipart_upload("v.mp4", "video/mp4", 10).await.unwrap();
        assert_eq!(id, "up-9");
        assert_eq!(store.get_multipart_part_url(&id, 2).await.unwrap(), "https://r2/p2");
        store.register_multipart_part(&id, 2, "e2").await.unwrap();
        store.abort_multipart_upload(&id).await.unwrap();
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let config = ClientConfig::new("not a url", "http://localhost/storage");
        let err = HttpRecordStore::new(&config, SessionToken::default()).err().unwrap();
        assert!(matches!(err, UploadError::Config(_)));
    }
}
