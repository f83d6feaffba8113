//! Command-line and environment configuration.
//!
//! Every option can be given as a long flag or through its environment
//! variable. The endpoint is the only mandatory input; everything else has a
//! neutral default.

use crate::error::{RelayError, Result};
use clap::Parser;
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};
use tracing::warn;
use url::Url;

/// Default per-attempt HTTP timeout.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Bridge a stdio JSON-RPC client to an HTTP MCP endpoint.
///
/// Reads one JSON-RPC message per line on stdin, POSTs it to the endpoint and
/// writes the replies to stdout, one per line.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcp_relay")]
#[command(version, about)]
pub struct Args {
    /// Upstream MCP endpoint (absolute http:// or https:// URL).
    #[arg(long, env = "MCP_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Bearer token sent as `Authorization: Bearer <token>`.
    #[arg(long, env = "MCP_AUTH_TOKEN", hide_env_values = true)]
    pub auth_token: Option<String>,

    /// Extra request headers, either a JSON object (`{"X-A":"1"}`) or
    /// comma-separated `name:value` pairs. Values cannot contain commas.
    #[arg(long, env = "MCP_CUSTOM_HEADERS")]
    pub custom_headers: Option<String>,

    /// Write diagnostics to stderr (`1`, `true`, `yes`, `on`).
    #[arg(long, env = "MCP_DEBUG", num_args = 0..=1, default_missing_value = "true")]
    pub debug: Option<String>,

    /// Timeout in seconds for each HTTP attempt.
    #[arg(long, env = "MCP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Let in-flight requests finish when stdin closes instead of exiting at once.
    #[arg(long, env = "MCP_DRAIN_ON_EOF", num_args = 0..=1, default_missing_value = "true")]
    pub drain_on_eof: Option<String>,
}

/// Immutable relay configuration, built once at startup.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upstream JSON-RPC endpoint.
    pub endpoint: Url,
    /// Optional bearer token.
    pub bearer_token: Option<String>,
    /// Headers merged over the defaults. Keys are kept exactly as supplied.
    pub custom_headers: BTreeMap<String, String>,
    /// Whether the diagnostic channel is enabled.
    pub debug: bool,
    /// Upper bound for a single HTTP attempt.
    pub request_timeout: Duration,
    /// Finish in-flight requests on end of input.
    pub drain_on_eof: bool,
}

impl BridgeConfig {
    /// Configuration with only the endpoint set.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            bearer_token: None,
            custom_headers: BTreeMap::new(),
            debug: false,
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            drain_on_eof: false,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Validates parsed arguments into a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] when the endpoint is missing or is not
    /// an absolute HTTP(S) URL.
    pub fn from_args(args: &Args) -> Result<Self> {
        let endpoint = parse_endpoint(args.endpoint.as_deref())?;

        let bearer_token = args
            .auth_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(String::from);

        let custom_headers = args
            .custom_headers
            .as_deref()
            .map(parse_custom_headers)
            .unwrap_or_default();

        Ok(Self {
            endpoint,
            bearer_token,
            custom_headers,
            debug: parse_flag(args.debug.as_deref()),
            request_timeout: Duration::from_secs(args.timeout_secs),
            drain_on_eof: parse_flag(args.drain_on_eof.as_deref()),
        })
    }
}

/// Parses the endpoint, rejecting anything but absolute `http`/`https` URLs.
pub fn parse_endpoint(raw: Option<&str>) -> Result<Url> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
        RelayError::Config("MCP_ENDPOINT environment variable is required".to_string())
    })?;

    let url = Url::parse(raw)
        .map_err(|e| RelayError::Config(format!("Invalid MCP_ENDPOINT '{}': {}", raw, e)))?;

    match url.scheme() {
        "http" | "https" if url.has_host() => Ok(url),
        scheme => Err(RelayError::Config(format!(
            "Invalid MCP_ENDPOINT '{}': expected an http or https URL, got scheme '{}'",
            raw, scheme
        ))),
    }
}

/// Interprets boolean-ish strings such as `1`, `true`, `yes` and `on`.
pub fn parse_flag(raw: Option<&str>) -> bool {
    raw.map(|v| v.trim().to_ascii_lowercase())
        .is_some_and(|v| matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

/// Parses custom headers from a JSON object or `name:value,name:value` pairs.
///
/// Malformed entries are skipped with a warning; they never abort startup.
pub fn parse_custom_headers(raw: &str) -> BTreeMap<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return BTreeMap::new();
    }

    let candidates: Vec<(String, String)> = if raw.starts_with('{') {
        match serde_json::from_str::<serde_json::Map<String, Value>>(raw) {
            Ok(map) => map
                .into_iter()
                .map(|(name, value)| {
                    let value = match value {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (name, value)
                })
                .collect(),
            Err(e) => {
                warn!("Ignoring custom headers: not a valid JSON object: {}", e);
                return BTreeMap::new();
            }
        }
    } else {
        raw.split(',')
            .filter(|entry| !entry.trim().is_empty())
            .filter_map(|entry| match entry.split_once(':') {
                Some((name, value)) if !name.trim().is_empty() => {
                    Some((name.trim().to_string(), value.trim().to_string()))
                }
                _ => {
                    warn!("Ignoring malformed custom header entry '{}'", entry.trim());
                    None
                }
            })
            .collect()
    };

    candidates
        .into_iter()
        .filter(|(name, value)| {
            let valid = HeaderName::from_bytes(name.as_bytes()).is_ok()
                && HeaderValue::from_str(value).is_ok();
            if !valid {
                warn!("Ignoring custom header '{}': not a valid HTTP header", name);
            }
            valid
        })
        .collect()
}
