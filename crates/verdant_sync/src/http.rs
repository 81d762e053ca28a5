//! HTTP adapter for the write and fetch ports.
//!
//! The actual HTTP client is abstracted via a trait so the app can plug in
//! whatever client its platform provides.

use crate::error::{SyncError, SyncResult};
use crate::ports::{CredentialSource, EntityFetchPort, RemoteWritePort};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use verdant_protocol::{
    MutationPayload, MutationRecord, Post, PostId, PostSnapshot, Timestamp, WriteAck,
};

/// Header carrying the mutation id.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// DELETE
    Delete,
}

impl HttpMethod {
    /// Returns the method name.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Method.
    pub method: HttpMethod,
    /// Absolute URL.
    pub url: String,
    /// Header name/value pairs.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Returns the first value of a header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Body bytes.
    pub body: Vec<u8>,
}

/// HTTP client abstraction.
///
/// `Err` means no response was received (DNS, connect, reset); such errors
/// are treated as transient.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Performs one request.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// Write and fetch ports over a JSON HTTP API.
///
/// | Mutation | Request |
/// |---|---|
/// | Like | `POST /posts/{id}/like` |
/// | Unlike | `DELETE /posts/{id}/like` |
/// | Comment | `POST /posts/{id}/comments` |
/// | CreatePost | `POST /posts` |
/// | DeletePost | `DELETE /posts/{id}` |
///
/// Every write carries the mutation id in the `Idempotency-Key` header and
/// expects a [`WriteAck`] body.
pub struct HttpWritePort<C: HttpClient> {
    base_url: String,
    client: C,
    credentials: Arc<dyn CredentialSource>,
}

impl<C: HttpClient> HttpWritePort<C> {
    /// Creates a port against `base_url` (e.g. `https://api.example.com`).
    pub fn new(
        base_url: impl Into<String>,
        client: C,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            credentials,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds the request for one mutation, without credentials.
    pub fn write_request(&self, record: &MutationRecord) -> SyncResult<HttpRequest> {
        let post = &record.target_id;
        let (method, path, body) = match &record.payload {
            MutationPayload::Like => (HttpMethod::Post, format!("/posts/{post}/like"), None),
            MutationPayload::Unlike => (HttpMethod::Delete, format!("/posts/{post}/like"), None),
            MutationPayload::Comment {
                comment_id,
                content,
                ..
            } => (
                HttpMethod::Post,
                format!("/posts/{post}/comments"),
                Some(json!({ "clientRef": comment_id, "content": content })),
            ),
            MutationPayload::CreatePost {
                content,
                image_ref,
                ..
            } => (
                HttpMethod::Post,
                "/posts".to_string(),
                Some(json!({ "clientRef": post, "content": content, "imageRef": image_ref })),
            ),
            MutationPayload::DeletePost => (HttpMethod::Delete, format!("/posts/{post}"), None),
        };

        let body = body
            .map(|value| serde_json::to_vec(&value))
            .transpose()
            .map_err(|e| SyncError::rejected(None, format!("failed to encode body: {e}")))?;
        let mut headers = vec![(IDEMPOTENCY_KEY_HEADER.to_string(), record.id.to_string())];
        if body.is_some() {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        Ok(HttpRequest {
            method,
            url: format!("{}{}", self.base_url, path),
            headers,
            body,
        })
    }

    async fn execute<T: DeserializeOwned>(&self, mut request: HttpRequest) -> SyncResult<T> {
        let token = self.credentials.bearer_token().await?;
        request
            .headers
            .push(("Authorization".to_string(), format!("Bearer {token}")));

        let method = request.method;
        let url = request.url.clone();
        let response = self
            .client
            .execute(request)
            .await
            .map_err(SyncError::transport_retryable)?;
        debug!(method = method.as_str(), %url, status = response.status, "http response");

        classify_status(response.status, &response.body)?;
        serde_json::from_slice(&response.body)
            .map_err(|e| SyncError::rejected(Some(response.status), format!("invalid response body: {e}")))
    }
}

/// Maps a status code to the error taxonomy.
///
/// 408, 429 and 5xx are transient; any other non-2xx status is a permanent
/// rejection.
pub fn classify_status(status: u16, body: &[u8]) -> SyncResult<()> {
    match status {
        200..=299 => Ok(()),
        408 | 429 | 500..=599 => Err(SyncError::transport_retryable(format!(
            "server returned {status}"
        ))),
        _ => {
            let message = String::from_utf8_lossy(body).trim().to_string();
            let message = if message.is_empty() {
                format!("status {status}")
            } else {
                message
            };
            Err(SyncError::rejected(Some(status), message))
        }
    }
}

#[async_trait]
impl<C: HttpClient> RemoteWritePort for HttpWritePort<C> {
    async fn send(&self, record: &MutationRecord) -> SyncResult<WriteAck> {
        let request = self.write_request(record)?;
        self.execute(request).await
    }
}

#[async_trait]
impl<C: HttpClient> EntityFetchPort for HttpWritePort<C> {
    async fn fetch_feed(&self) -> SyncResult<Vec<Post>> {
        self.execute(HttpRequest {
            method: HttpMethod::Get,
            url: format!("{}/feed", self.base_url),
            headers: Vec::new(),
            body: None,
        })
        .await
    }

    async fn fetch_posts(&self, ids: &[PostId]) -> SyncResult<PostSnapshot> {
        if ids.is_empty() {
            return Ok(PostSnapshot::new(Vec::new(), Timestamp::default()));
        }
        let ids: Vec<&str> = ids.iter().map(|id| id.as_str()).collect();
        self.execute(HttpRequest {
            method: HttpMethod::Get,
            url: format!("{}/posts?ids={}", self.base_url, ids.join(",")),
            headers: Vec::new(),
            body: None,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::StaticCredential;
    use parking_lot::Mutex;
    use verdant_protocol::{MutationId, MutationKind, ServerState, Timestamp, UserId};

    struct Recorder {
        requests: Mutex<Vec<HttpRequest>>,
        reply: Mutex<Result<HttpResponse, String>>,
    }

    impl Recorder {
        fn replying(status: u16, body: Vec<u8>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                reply: Mutex::new(Ok(HttpResponse { status, body })),
            }
        }
    }

    #[async_trait]
    impl HttpClient for Arc<Recorder> {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.requests.lock().push(request);
            self.reply.lock().clone()
        }
    }

    fn port(recorder: &Arc<Recorder>) -> HttpWritePort<Arc<Recorder>> {
        HttpWritePort::new(
            "https://api.test/",
            Arc::clone(recorder),
            Arc::new(StaticCredential::new("tok")),
        )
    }

    fn ack_body(id: MutationId) -> Vec<u8> {
        serde_json::to_vec(&WriteAck::new(
            id,
            Timestamp::from_millis(10),
            ServerState::Likes {
                like_count: 1,
                liked_by_me: true,
            },
        ))
        .unwrap()
    }

    fn record(kind: MutationKind, payload: MutationPayload) -> MutationRecord {
        MutationRecord::new(1, kind, PostId::new("42"), payload).unwrap()
    }

    #[tokio::test]
    async fn like_sends_idempotency_key_and_token() {
        let like = record(MutationKind::Like, MutationPayload::Like);
        let recorder = Arc::new(Recorder::replying(200, ack_body(like.id)));
        let ack = port(&recorder).send(&like).await.unwrap();
        assert_eq!(ack.mutation_id, like.id);

        let requests = recorder.requests.lock();
        let request = &requests[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "https://api.test/posts/42/like");
        assert_eq!(request.header("idempotency-key"), Some(like.id.to_string().as_str()));
        assert_eq!(request.header("Authorization"), Some("Bearer tok"));
        assert!(request.body.is_none());
    }

    #[test]
    fn request_shapes() {
        let recorder = Arc::new(Recorder::replying(200, Vec::new()));
        let port = port(&recorder);

        let unlike = port.write_request(&record(MutationKind::Unlike, MutationPayload::Unlike)).unwrap();
        assert_eq!(unlike.method, HttpMethod::Delete);
        assert_eq!(unlike.url, "https://api.test/posts/42/like");

        let comment = record(
            MutationKind::Comment,
            MutationPayload::comment(UserId::new("me"), "looks like rust"),
        );
        let request = port.write_request(&comment).unwrap();
        let body: serde_json::Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
        assert_eq!(body["content"], "looks like rust");
        assert_eq!(body["clientRef"], comment.comment_id().unwrap().as_str());
        assert_eq!(request.header("content-type"), Some("application/json"));

        let delete = port.write_request(&record(MutationKind::DeletePost, MutationPayload::DeletePost)).unwrap();
        assert_eq!(delete.url, "https://api.test/posts/42");
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(201, b"").is_ok());
        for status in [408, 429, 500, 502, 503] {
            assert!(classify_status(status, b"").unwrap_err().is_retryable(), "{status}");
        }
        for status in [400, 401, 403, 404, 409, 422] {
            let err = classify_status(status, b"nope").unwrap_err();
            assert!(!err.is_retryable(), "{status}");
            assert!(matches!(err, SyncError::PermanentRejection { status: Some(s), .. } if s == status));
        }
    }

    #[tokio::test]
    async fn connection_failure_is_transient() {
        let recorder = Arc::new(Recorder {
            requests: Mutex::new(Vec::new()),
            reply: Mutex::new(Err("connection refused".to_string())),
        });
        let err = port(&recorder)
            .send(&record(MutationKind::Like, MutationPayload::Like))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn fetch_posts_builds_query() {
        let body = br#"{"posts": [], "serverTimestamp": 77}"#.to_vec();
        let recorder = Arc::new(Recorder::replying(200, body));
        let snapshot = port(&recorder)
            .fetch_posts(&[PostId::new("1"), PostId::new("2")])
            .await
            .unwrap();
        assert!(snapshot.posts.is_empty());
        assert_eq!(snapshot.server_timestamp, Timestamp::from_millis(77));
        assert_eq!(recorder.requests.lock()[0].url, "https://api.test/posts?ids=1,2");
    }

    #[tokio::test]
    async fn fetch_no_posts_skips_request() {
        let recorder = Arc::new(Recorder::replying(500, Vec::new()));
        let snapshot = port(&recorder).fetch_posts(&[]).await.unwrap();
        assert!(snapshot.posts.is_empty());
        assert!(recorder.requests.lock().is_empty());
    }
}
