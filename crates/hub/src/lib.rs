//! vtx hub: control-plane transport.
//!
//! Everything above this crate talks to the remote API through [`Transport::send`]. The HTTP
//! implementation does no retries; callers decide what is worth repeating.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One outbound call. `project` is the project the request is billed to.
#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: Method,
    pub project: &'a str,
    pub url: &'a str,
    pub body: Option<&'a Json>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("remote error {status}: {message}")]
    Remote { status: u16, message: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("invalid url {url}: {reason}")]
    Url { url: String, reason: String },
}

impl TransportError {
    pub fn not_found(message: impl Into<String>) -> Self {
        TransportError::Remote { status: 404, message: message.into() }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool { self.status() == Some(404) }

    /// Transient conditions: connection failures, request timeout, throttling, server errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Connection(_) => true,
            TransportError::Remote { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: Request<'_>) -> Result<Json, TransportError>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn send(&self, req: Request<'_>) -> Result<Json, TransportError> { (**self).send(req).await }
}

/// Append query parameters, percent-encoding values.
pub fn add_query_params(url: &str, params: &[(&str, &str)]) -> Result<String, TransportError> {
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|e| TransportError::Url { url: url.to_string(), reason: e.to_string() })?;
    {
        let mut pairs = parsed.query_pairs_mut();
        for (k, v) in params { pairs.append_pair(k, v); }
    }
    Ok(parsed.to_string())
}

// ----------------- HTTP implementation -----------------

/// reqwest-backed transport for Google-style JSON APIs.
pub struct HttpTransport {
    client: reqwest::Client,
    access_token: Option<String>,
    user_project_override: bool,
}

impl HttpTransport {
    pub fn new(access_token: Option<String>, user_project_override: bool) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("vtx/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { client, access_token, user_project_override })
    }

    /// `VTX_ACCESS_TOKEN` (bearer) and `VTX_USER_PROJECT_OVERRIDE=1`.
    pub fn from_env() -> Result<Self, TransportError> {
        let token = std::env::var("VTX_ACCESS_TOKEN").ok().filter(|s| !s.is_empty());
        let upo = std::env::var("VTX_USER_PROJECT_OVERRIDE")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self::new(token, upo)
    }

    fn method(m: Method) -> reqwest::Method {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Pull `error.message` out of a Google-style error body, else return the body text.
fn remote_message(body: &[u8]) -> String {
    serde_json::from_slice::<Json>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()).map(|s| s.to_string()))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

fn decode_body(body: &[u8]) -> Result<Json, TransportError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Json::Object(Default::default()));
    }
    serde_json::from_slice(body).map_err(|e| TransportError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn send(&self, req: Request<'_>) -> Result<Json, TransportError> {
        let t0 = StdInstant::now();
        let mut rb = self.client.request(Self::method(req.method), req.url);
        if !req.timeout.is_zero() { rb = rb.timeout(req.timeout); }
        if let Some(token) = &self.access_token { rb = rb.bearer_auth(token); }
        if self.user_project_override && !req.project.is_empty() {
            rb = rb.header("X-Goog-User-Project", req.project);
        }
        if let Some(body) = req.body { rb = rb.json(body); }

        let resp = rb.send().await.map_err(|e| {
            counter!("transport_err", 1u64);
            TransportError::Connection(e.to_string())
        })?;
        let status = resp.status();
        let bytes = resp.bytes().await.map_err(|e| TransportError::Connection(e.to_string()))?;
        histogram!("transport_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(method = %req.method, url = %req.url, status = status.as_u16(), bytes = bytes.len(), "transport: response");
        if !status.is_success() {
            counter!("transport_err", 1u64);
            return Err(TransportError::Remote { status: status.as_u16(), message: remote_message(&bytes) });
        }
        decode_body(&bytes)
    }
}

// ----------------- Mock implementation -----------------

/// Request as seen by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub project: String,
    pub url: String,
    pub body: Option<Json>,
    pub timeout: Duration,
    pub at: tokio::time::Instant,
}

type Handler = dyn Fn(&RecordedRequest) -> Result<Json, TransportError> + Send + Sync;

/// Scripted in-memory transport for tests. Every request is recorded, then answered by the
/// handler.
pub struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockTransport {
    pub fn new(handler: impl Fn(&RecordedRequest) -> Result<Json, TransportError> + Send + Sync + 'static) -> Self {
        Self { handler: Box::new(handler), requests: Mutex::new(Vec::new()) }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests().iter().filter(|r| r.method == method).count()
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn send(&self, req: Request<'_>) -> Result<Json, TransportError> {
        let rec = RecordedRequest {
            method: req.method,
            project: req.project.to_string(),
            url: req.url.to_string(),
            body: req.body.cloned(),
            timeout: req.timeout,
            at: tokio::time::Instant::now(),
        };
        if let Ok(mut log) = self.requests.lock() { log.push(rec.clone()); }
        (self.handler)(&rec)
    }
}
