use std::time::Instant;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{CacheMode, ResponseCache};
use crate::error::GatewayError;
use crate::invalidation::ResourceTag;

#[derive(Debug, Clone, PartialEq)]
pub enum FormPart {
    Text { name: String, value: String },
    File { name: String, file_name: String, content_type: Option<String>, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Payload {
    #[default]
    Empty,
    Json(Value),
    /// Sent as `multipart/form-data`; the boundary header comes from the
    /// HTTP client, never from us.
    Multipart(Vec<FormPart>),
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub payload: Payload,
    pub token: Option<String>,
    pub public: bool,
    pub cache: CacheMode,
    pub tags: Vec<ResourceTag>,
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self { method, payload: Payload::Empty, token: None, public: false, cache: CacheMode::NoStore, tags: Vec::new() }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(payload: Payload) -> Self {
        Self::new(Method::POST).payload(payload)
    }

    pub fn put(payload: Payload) -> Self {
        Self::new(Method::PUT).payload(payload)
    }

    pub fn delete() -> Self {
        Self::new(Method::DELETE)
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn token(mut self, token: Option<&str>) -> Self {
        self.token = token.map(str::to_string);
        self
    }

    /// Endpoints reachable without a session, i.e. sign-in and sign-up.
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    pub fn cache(mut self, mode: CacheMode, tags: Vec<ResourceTag>) -> Self {
        self.cache = mode;
        self.tags = tags;
        self
    }
}

/// Outbound calls to the backend API.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, path: &str, opts: RequestOptions) -> Result<Value, GatewayError>;
}

#[derive(Clone)]
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    cache: Option<ResponseCache>,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    fn cache_ttl(&self, opts: &RequestOptions) -> Option<(&ResponseCache, std::time::Duration)> {
        match (&self.cache, opts.cache) {
            (Some(cache), CacheMode::Revalidate(ttl)) if opts.method == Method::GET => Some((cache, ttl)),
            _ => None,
        }
    }
}

#[async_trait]
impl Transport for HttpGateway {
    async fn request(&self, path: &str, opts: RequestOptions) -> Result<Value, GatewayError> {
        if !opts.public && opts.token.is_none() {
            return Err(GatewayError::Unauthorized);
        }

        if let Some((cache, _)) = self.cache_ttl(&opts) {
            if let Some(hit) = cache.get(path, opts.token.as_deref()).await {
                debug!(path, "served from response cache");
                return Ok(hit);
            }
        }

        let url = format!("{}{}", self.base_url, path);
        let mut rb = self.client.request(opts.method.clone(), url);
        rb = match &opts.payload {
            Payload::Json(body) if opts.method != Method::GET => rb.json(body),
            Payload::Multipart(parts) => rb.multipart(build_form(parts)?),
            _ => rb.header(CONTENT_TYPE, "application/json"),
        };
        if let Some(token) = &opts.token {
            rb = rb.bearer_auth(token);
        }

        let epoch = self.cache.as_ref().map(ResponseCache::epoch);
        let started = Instant::now();
        let resp = rb.send().await.map_err(|e| {
            warn!(method = %opts.method, path, error = %e, "backend unreachable");
            metrics::counter!("gateway_requests_total", "method" => opts.method.to_string(), "outcome" => "network_error").increment(1);
            GatewayError::from(e)
        })?;
        let status = resp.status();
        debug!(method = %opts.method, path, status = status.as_u16(), elapsed_ms = started.elapsed().as_millis() as u64, "backend request");
        let outcome = if status.is_success() { "ok" } else { "error" };
        metrics::counter!("gateway_requests_total", "method" => opts.method.to_string(), "outcome" => outcome).increment(1);

        let body = resp.bytes().await?;
        if !status.is_success() {
            return Err(error_from_response(status, &body));
        }

        let value = if body.iter().all(u8::is_ascii_whitespace) {
            Value::Null
        } else {
            serde_json::from_slice(&body).map_err(|e| GatewayError::Network(format!("invalid JSON from backend: {e}")))?
        };

        if let (Some((cache, ttl)), Some(epoch)) = (self.cache_ttl(&opts), epoch) {
            let stored = cache.put_observed(epoch, path, opts.token.as_deref(), value.clone(), &opts.tags, ttl).await;
            if !stored {
                debug!(path, "invalidated while in flight, not cached");
            }
        }
        Ok(value)
    }
}

fn build_form(parts: &[FormPart]) -> Result<reqwest::multipart::Form, GatewayError> {
    let mut form = reqwest::multipart::Form::new();
    for part in parts {
        form = match part {
            FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
            FormPart::File { name, file_name, content_type, bytes } => {
                let mut file = reqwest::multipart::Part::bytes(bytes.clone()).file_name(file_name.clone());
                if let Some(ct) = content_type {
                    file = file
                        .mime_str(ct)
                        .map_err(|_| GatewayError::validation(format!("invalid content type {ct:?}")))?;
                }
                form.part(name.clone(), file)
            }
        };
    }
    Ok(form)
}

/// Message for a failed response: `detail`, then `message`, then a generic
/// fallback; a body that is not JSON yields `HTTP {code}: {reason}`.
pub fn error_from_response(status: StatusCode, body: &[u8]) -> GatewayError {
    if status == StatusCode::UNAUTHORIZED {
        return GatewayError::Unauthorized;
    }
    let message = match serde_json::from_slice::<Value>(body) {
        Ok(v) => match v.get("detail").filter(|d| !d.is_null()) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => v
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("An error occurred")
                .to_string(),
        },
        Err(_) => format!("HTTP {}: {}", status.as_u16(), status.canonical_reason().unwrap_or("")),
    };
    GatewayError::Upstream { status: status.as_u16(), message }
}
