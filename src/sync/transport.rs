//! HTTP Transport - uniform request/response handling for the sync server
//!
//! Every call resolves to `Ok(ResponseData)` or a `TransportError`; network
//! failures, timeouts and unexpected statuses are all folded into the error
//! value, never surfaced as a raw client error.
//!
//! Status mapping:
//! - 200 / 302: success, body decoded per `ResponseType`
//! - 401: confirmed with a `HEAD /` request (unreachable servers answer CORS
//!   preflights with 401); unauthorized if it succeeds, unavailable otherwise
//! - 403: unauthorized
//! - 201: "no content" (this API never returns useful data with a 201)
//! - anything else: server error with status and status text

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

/// Error code used when the server cannot be reached
pub const UNAVAILABLE: u16 = 0;

const JSON_CONTENT_TYPE: &str = "application/json";

// ============================================================================
// Request / Response Types
// ============================================================================

/// How the response body should be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    #[default]
    Json,
    Text,
    Binary,
}

/// Description of a single HTTP call
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path joined to the configured endpoint, or an absolute URL
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, Value)>,
    pub body: Option<Value>,
    pub content_type: String,
    pub response_type: ResponseType,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            content_type: JSON_CONTENT_TYPE.to_string(),
            response_type: ResponseType::Json,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn head(path: impl Into<String>) -> Self {
        Self::new(Method::HEAD, path)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn expect(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Attach (or replace) the bearer credential
    pub fn bearer(self, access_token: &str) -> Self {
        self.with_header("Authorization", format!("Bearer {}", access_token))
    }
}

/// Decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Json(Value),
    Text(String),
    Binary(Vec<u8>),
}

impl ResponseData {
    /// Interpret the body as JSON
    pub fn into_json(self) -> Result<Value, TransportError> {
        match self {
            ResponseData::Json(value) => Ok(value),
            ResponseData::Text(text) => serde_json::from_str(&text)
                .map_err(|e| TransportError::InvalidResponse { status: 200, message: e.to_string() }),
            ResponseData::Binary(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| TransportError::InvalidResponse { status: 200, message: e.to_string() }),
        }
    }

    /// Raw bytes of the body
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            ResponseData::Json(value) => value.to_string().into_bytes(),
            ResponseData::Text(text) => text.into_bytes(),
            ResponseData::Binary(bytes) => bytes,
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("Sync endpoint is not configured")]
    MisconfiguredEndpoint,

    #[error("Server unavailable: {0}")]
    Unavailable(String),

    #[error("Unauthorized ({status})")]
    Unauthorized { status: u16 },

    #[error("Server returned no content")]
    NoContent,

    #[error("Server error {status}: {status_text}")]
    Server { status: u16, status_text: String },

    #[error("Invalid response from server ({status}): {message}")]
    InvalidResponse { status: u16, message: String },

    #[error("HTTP client initialization failed: {0}")]
    ClientInit(String),
}

impl TransportError {
    /// Numeric error code (HTTP status, or 0 when the server was not reached)
    pub fn code(&self) -> u16 {
        match self {
            TransportError::MisconfiguredEndpoint
            | TransportError::Unavailable(_)
            | TransportError::ClientInit(_) => UNAVAILABLE,
            TransportError::Unauthorized { status } => *status,
            TransportError::NoContent => StatusCode::CREATED.as_u16(),
            TransportError::Server { status, .. } => *status,
            TransportError::InvalidResponse { status, .. } => *status,
        }
    }

    /// 401 or 403
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, TransportError::Unauthorized { .. })
    }
}

// ============================================================================
// Transport
// ============================================================================

/// HTTP transport bound to one sync endpoint
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    /// Create a transport for `endpoint` with a per-request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::ClientInit(e.to_string()))?;

        Ok(Self::with_client(client, endpoint))
    }

    /// Create a transport around an existing client
    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim().to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Perform the request and map the outcome
    pub async fn send(&self, request: &ApiRequest) -> Result<ResponseData, TransportError> {
        let url = self.resolve_url(&request.path, &request.query)?;

        log::debug!("{} {}", request.method, url);

        let response = self.dispatch(&url, request).await.map_err(|e| {
            log::warn!("Request {} {} failed: {}", request.method, request.path, e);
            TransportError::Unavailable(e.to_string())
        })?;

        let status = response.status();
        match status {
            StatusCode::OK | StatusCode::FOUND => decode_body(response, request.response_type).await,
            StatusCode::UNAUTHORIZED => {
                if request.method == Method::HEAD || self.is_available().await {
                    Err(TransportError::Unauthorized { status: status.as_u16() })
                } else {
                    log::warn!("401 on {} but server does not answer HEAD /, treating as unavailable", request.path);
                    Err(TransportError::Unavailable(
                        "server did not answer the availability check".to_string(),
                    ))
                }
            }
            StatusCode::FORBIDDEN => Err(TransportError::Unauthorized { status: status.as_u16() }),
            StatusCode::CREATED => Err(TransportError::NoContent),
            _ => Err(TransportError::Server {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or("Unknown error").to_string(),
            }),
        }
    }

    /// Check whether the server answers at all
    async fn is_available(&self) -> bool {
        let check = ApiRequest::head("/");
        let url = match self.resolve_url(&check.path, &check.query) {
            Ok(url) => url,
            Err(_) => return false,
        };

        match self.dispatch(&url, &check).await {
            Ok(response) => matches!(response.status(), StatusCode::OK | StatusCode::FOUND),
            Err(e) => {
                log::debug!("Availability check failed: {}", e);
                false
            }
        }
    }

    async fn dispatch(&self, url: &Url, request: &ApiRequest) -> Result<Response, reqwest::Error> {
        let mut builder = self.client.request(request.method.clone(), url.clone());

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, request.content_type.as_str())
                .body(encode_body(body, &request.content_type));
        }

        builder.send().await
    }

    fn resolve_url(&self, path: &str, query: &[(String, Value)]) -> Result<Url, TransportError> {
        let mut url = if path.starts_with("http://") || path.starts_with("https://") {
            Url::parse(path).map_err(|_| TransportError::MisconfiguredEndpoint)?
        } else {
            if self.endpoint.is_empty() {
                return Err(TransportError::MisconfiguredEndpoint);
            }
            let joined = format!(
                "{}/{}",
                self.endpoint.trim_end_matches('/'),
                path.trim_start_matches('/')
            );
            Url::parse(&joined).map_err(|_| TransportError::MisconfiguredEndpoint)?
        };

        let extra = build_query_string(query);
        if !extra.is_empty() {
            let combined = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{}&{}", existing, extra),
                _ => extra,
            };
            url.set_query(Some(&combined));
        }

        Ok(url)
    }
}

async fn decode_body(response: Response, response_type: ResponseType) -> Result<ResponseData, TransportError> {
    let status = response.status().as_u16();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;

    match response_type {
        ResponseType::Binary => Ok(ResponseData::Binary(bytes.to_vec())),
        ResponseType::Text => String::from_utf8(bytes.to_vec())
            .map(ResponseData::Text)
            .map_err(|e| TransportError::InvalidResponse { status, message: e.to_string() }),
        ResponseType::Json => {
            if bytes.iter().all(|b| b.is_ascii_whitespace()) {
                return Ok(ResponseData::Json(Value::Null));
            }
            serde_json::from_slice(&bytes)
                .map(ResponseData::Json)
                .map_err(|e| TransportError::InvalidResponse { status, message: e.to_string() })
        }
    }
}

/// JSON-encode records when the content type is JSON; strings go out verbatim
fn encode_body(body: &Value, content_type: &str) -> Vec<u8> {
    match body {
        Value::String(raw) => raw.clone().into_bytes(),
        Value::Object(_) if content_type.contains("json") => body.to_string().into_bytes(),
        other => other.to_string().into_bytes(),
    }
}

/// Build a query string; object and array values are flattened to `key[sub]=value`
pub fn build_query_string(params: &[(String, Value)]) -> String {
    let mut pairs = Vec::new();
    for (key, value) in params {
        flatten_param(&urlencoding::encode(key), value, &mut pairs);
    }
    pairs.join("&")
}

fn flatten_param(key: &str, value: &Value, pairs: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (sub, inner) in map {
                flatten_param(&format!("{}[{}]", key, urlencoding::encode(sub)), inner, pairs);
            }
        }
        Value::Array(items) => {
            for (index, inner) in items.iter().enumerate() {
                flatten_param(&format!("{}[{}]", key, index), inner, pairs);
            }
        }
        Value::Null => pairs.push(format!("{}=", key)),
        Value::String(s) => pairs.push(format!("{}={}", key, urlencoding::encode(s))),
        other => pairs.push(format!("{}={}", key, urlencoding::encode(&other.to_string()))),
    }
}

// ============================================================================
// Tests
// ============================================================================
