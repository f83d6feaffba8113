//! HTTP transport for JSON-RPC calls.
//!
//! One call is one POST: no internal retries, a bounded timeout, and the whole
//! body is buffered before it is interpreted. The outcome is classified into
//! [`RpcOutcome`] so the orchestrator can tell an expired session (`404`)
//! apart from every other failure.

use crate::{
    error::SendError,
    headers::{HeaderSet, MCP_SESSION_ID_HEADER},
};
use async_trait::async_trait;
use reqwest::{
    StatusCode,
    header::{CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue},
};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Longest slice of a raw error body quoted in a message.
const MAX_BODY_EXCERPT_CHARS: usize = 200;

/// Message used when a WordPress-style REST endpoint rejects the credentials.
pub const AUTHENTICATION_FAILED_MESSAGE: &str =
    "Authentication failed: check that the bearer token is valid";

/// Result of one HTTP round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    /// 2xx. One raw JSON text per non-blank body line that parsed.
    Success(Vec<String>),
    /// Non-2xx whose body is a complete JSON-RPC error envelope.
    ServerRpcError { code: Option<i64>, message: String },
    /// Any other non-2xx status except 404.
    HttpError {
        status: u16,
        code: Option<i64>,
        message: String,
    },
    /// 404: the upstream no longer knows the session.
    NotFound { body: String },
    /// Connection failure, timeout or an unsendable request.
    TransportError(String),
}

/// An outcome together with the session header of the response, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportReply {
    pub outcome: RpcOutcome,
    /// Value of `Mcp-Session-Id`, whatever the status code.
    pub session_id: Option<String>,
}

impl TransportReply {
    pub fn new(outcome: RpcOutcome) -> Self {
        Self {
            outcome,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn transport_error(message: impl Into<String>) -> Self {
        Self::new(RpcOutcome::TransportError(message.into()))
    }
}

/// Sends a single JSON-RPC body upstream.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn send(&self, headers: &HeaderSet, body: &Value) -> TransportReply;
}

/// [`RpcTransport`] over HTTP POST using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Fails only if the TLS backend cannot be initialised.
    pub fn new(url: Url, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            client,
            url,
            timeout,
        })
    }

    async fn round_trip(
        &self,
        headers: HeaderMap,
        body: Vec<u8>,
    ) -> Result<TransportReply, SendError> {
        let response = self
            .client
            .post(self.url.clone())
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let session_id = extract_session_id(response.headers());
        let body = response.text().await?;

        debug!(
            status = status.as_u16(),
            session_id = ?session_id,
            body_len = body.len(),
            "Upstream response received"
        );

        Ok(TransportReply {
            outcome: interpret_response(status, &body),
            session_id,
        })
    }

    async fn attempt(
        &self,
        headers: &HeaderSet,
        body: &Value,
    ) -> Result<TransportReply, SendError> {
        let payload = serde_json::to_vec(body)?;
        let mut wire_headers = to_header_map(headers)?;
        wire_headers.insert(CONTENT_LENGTH, HeaderValue::from(payload.len()));

        tokio::time::timeout(self.timeout, self.round_trip(wire_headers, payload))
            .await
            .map_err(|_| SendError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn send(&self, headers: &HeaderSet, body: &Value) -> TransportReply {
        self.attempt(headers, body).await.unwrap_or_else(|e| {
            debug!(error = %e, "Upstream call failed");
            TransportReply::transport_error(e.to_string())
        })
    }
}

/// Converts composed headers to wire headers. Later entries replace earlier
/// ones that name the same header in a different case.
pub fn to_header_map(headers: &HeaderSet) -> Result<HeaderMap, SendError> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| SendError::InvalidHeaderName(name.to_string()))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| SendError::InvalidHeaderValue(name.to_string()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Reads the session header; `HeaderMap` lookups are case-insensitive.
pub fn extract_session_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(MCP_SESSION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Classifies a buffered response.
pub fn interpret_response(status: StatusCode, body: &str) -> RpcOutcome {
    if status.is_success() {
        return RpcOutcome::Success(split_json_lines(body));
    }

    if status == StatusCode::NOT_FOUND {
        return RpcOutcome::NotFound {
            body: body.to_string(),
        };
    }

    derive_http_error(status.as_u16(), body)
}

/// Splits a success body into independent JSON texts.
///
/// Blank lines are skipped and lines that do not parse are dropped, so a body
/// with one bad line still yields the good ones.
pub fn split_json_lines(body: &str) -> Vec<String> {
    body.trim()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter(|line| match serde_json::from_str::<Value>(line) {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, line = %line, "Dropping unparsable response line");
                false
            }
        })
        .map(String::from)
        .collect()
}

/// Derives code and message for a non-2xx, non-404 response.
pub fn derive_http_error(status: u16, body: &str) -> RpcOutcome {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let Some(json) = parsed.as_ref().filter(|v| v.is_object()) else {
        return RpcOutcome::HttpError {
            status,
            code: None,
            message: fallback_message(status, body),
        };
    };

    let status_suffix = |message: String| match json.pointer("/data/status") {
        Some(Value::String(s)) => format!("{} ({})", message, s),
        Some(Value::Null) | None => message,
        Some(other) => format!("{} ({})", message, other),
    };

    // REST-style error: {"code": "...", "message": "..."}
    if let (Some(code), Some(message)) = (
        json.get("code"),
        json.get("message").and_then(Value::as_str),
    ) {
        let message = if code.as_str() == Some("rest_forbidden") {
            if status == 401 {
                AUTHENTICATION_FAILED_MESSAGE.to_string()
            } else {
                format!("Forbidden: {}", message)
            }
        } else {
            message.to_string()
        };
        return RpcOutcome::HttpError {
            status,
            code: code.as_i64(),
            message: status_suffix(message),
        };
    }

    // JSON-RPC style error object.
    if let Some(error) = json.get("error").filter(|e| e.is_object()) {
        let code = error.get("code").and_then(Value::as_i64);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| fallback_message(status, body));
        let message = status_suffix(message);

        if json.get("jsonrpc").and_then(Value::as_str) == Some("2.0") {
            return RpcOutcome::ServerRpcError { code, message };
        }
        return RpcOutcome::HttpError {
            status,
            code,
            message,
        };
    }

    if let Some(message) = json.get("message").and_then(Value::as_str) {
        return RpcOutcome::HttpError {
            status,
            code: None,
            message: status_suffix(message.to_string()),
        };
    }

    RpcOutcome::HttpError {
        status,
        code: None,
        message: status_suffix(fallback_message(status, body)),
    }
}

fn fallback_message(status: u16, body: &str) -> String {
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        let excerpt: String = body.chars().take(MAX_BODY_EXCERPT_CHARS).collect();
        format!("HTTP {}: {}", status, excerpt)
    }
}
