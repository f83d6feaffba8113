//! Shared test utilities for relay integration tests.
//!
//! Every test gets its own `wiremock` server standing in for the upstream MCP
//! endpoint. Helpers here build a relay pointed at it and push input lines
//! through the real stdio adapter over an in-memory pipe.

// Allow dead_code - these are test utilities, and rustc can't see usage across test crates
#![allow(dead_code)]

use mcp_relay::{BridgeConfig, EofPolicy, HttpTransport, Orchestrator, serve};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tokio::io::{AsyncReadExt, BufReader};
use url::Url;
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

/// Path the mock upstream serves MCP on.
pub const MCP_PATH: &str = "/mcp";

/// Upstream URL for `server`.
pub fn endpoint(server: &MockServer) -> Url {
    Url::parse(&format!("{}{}", server.uri(), MCP_PATH)).expect("mock server URL")
}

/// Per-attempt timeout for relays under test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal config pointed at `server`.
pub fn config_for(server: &MockServer) -> BridgeConfig {
    BridgeConfig::new(endpoint(server)).with_timeout(TEST_TIMEOUT)
}

/// Relay over real HTTP with the given config.
pub fn relay(config: BridgeConfig) -> Arc<Orchestrator> {
    let transport = HttpTransport::new(config.endpoint.clone(), config.request_timeout)
        .expect("HTTP client");
    Arc::new(Orchestrator::new(Arc::new(config), Arc::new(transport)))
}

/// Feeds `lines` through the stdio adapter, waits for every reply, and
/// returns the raw output lines.
pub async fn run_lines(relay: Arc<Orchestrator>, lines: &[&str]) -> Vec<String> {
    let mut input = lines.join("\n");
    input.push('\n');

    let (mut client, server) = tokio::io::duplex(256 * 1024);
    serve(
        BufReader::new(input.as_bytes()),
        server,
        relay,
        EofPolicy::Drain,
    )
    .await
    .expect("relay should run to end of input");

    let mut output = String::new();
    client
        .read_to_string(&mut output)
        .await
        .expect("read relay output");
    output.lines().map(String::from).collect()
}

/// Parses every output line, failing the test if one is not JSON.
pub fn parse_lines(lines: &[String]) -> Vec<Value> {
    lines
        .iter()
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|e| panic!("output line is not JSON ({}): {}", e, line))
        })
        .collect()
}

/// A client `initialize` request line.
pub fn initialize_line(id: i64) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "test-client", "version": "1.0"}
        }
    })
    .to_string()
}

/// A request line for `method` with `id`.
pub fn request_line(id: Value, method: &str) -> String {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": {}}).to_string()
}

/// Session header value carried by a recorded request, if any.
pub fn session_of(request: &Request) -> Option<String> {
    request
        .headers
        .get("mcp-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// JSON body of a recorded request.
pub fn body_of(request: &Request) -> Value {
    serde_json::from_slice(&request.body).expect("request body is JSON")
}

/// Answers any JSON-RPC request with an empty result carrying the request's id.
pub struct EchoResult {
    pub session_id: Option<&'static str>,
    pub delay: Option<Duration>,
}

impl EchoResult {
    pub fn new() -> Self {
        Self {
            session_id: None,
            delay: None,
        }
    }

    pub fn with_session(session_id: &'static str) -> Self {
        Self {
            session_id: Some(session_id),
            delay: None,
        }
    }
}

impl Respond for EchoResult {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let reply = json!({
            "jsonrpc": "2.0",
            "id": body.get("id").cloned().unwrap_or(Value::Null),
            "result": {"echo": body.get("method").cloned().unwrap_or(Value::Null)}
        });

        let mut template = ResponseTemplate::new(200).set_body_json(reply);
        if let Some(session_id) = self.session_id {
            template = template.insert_header("Mcp-Session-Id", session_id);
        }
        if let Some(delay) = self.delay {
            template = template.set_delay(delay);
        }
        template
    }
}
