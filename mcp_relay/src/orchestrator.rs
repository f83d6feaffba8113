//! Per-message dispatch and session recovery.
//!
//! Every inbound line ends in exactly one of: the forwarded upstream lines,
//! one JSON-RPC error line, or nothing (notifications).
//!
//! ## Recovery protocol
//!
//! When a request comes back `404 Not Found` the upstream has dropped the
//! session. The orchestrator then:
//!
//! 1. clears the session,
//! 2. sends its own `initialize` (id `0`, no session header),
//! 3. resends the original request once with the new session.
//!
//! The recovery path never recurses: a failure in step 2 or 3, including
//! another `404`, is reported as an error reply carrying the original id.
//! Concurrent requests that hit `404` at the same time each run their own
//! recovery; the last session written wins.

use crate::{
    config::BridgeConfig,
    jsonrpc::{self, RpcMessage, SERVER_ERROR, error_reply},
    session::SessionManager,
    transport::{RpcOutcome, RpcTransport},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Id of the `initialize` the relay sends during recovery.
pub const RECOVERY_INITIALIZE_ID: i64 = 0;

/// MCP protocol revision announced by the recovery `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Longest slice of a 404 body quoted in an error message.
const MAX_NOT_FOUND_EXCERPT_CHARS: usize = 200;

/// Code and message of a failed exchange.
#[derive(Debug, Clone, PartialEq)]
struct Failure {
    code: i64,
    message: String,
}

impl Failure {
    fn reply(&self, id: &Value) -> String {
        error_reply(id.clone(), self.code, &self.message)
    }

    fn wrap(self, context: &str) -> Self {
        Self {
            code: self.code,
            message: format!("{}: {}", context, self.message),
        }
    }
}

/// Maps an outcome to the lines it produces or the failure it represents.
fn settle(outcome: RpcOutcome) -> Result<Vec<String>, Failure> {
    match outcome {
        RpcOutcome::Success(lines) => Ok(lines),
        RpcOutcome::ServerRpcError { code, message }
        | RpcOutcome::HttpError { code, message, .. } => Err(Failure {
            code: code.unwrap_or(SERVER_ERROR),
            message,
        }),
        RpcOutcome::NotFound { body } => {
            let body = body.trim();
            let message = if body.is_empty() {
                "Session not found (HTTP 404)".to_string()
            } else {
                let excerpt: String = body.chars().take(MAX_NOT_FOUND_EXCERPT_CHARS).collect();
                format!("Session not found (HTTP 404): {}", excerpt)
            };
            Err(Failure {
                code: SERVER_ERROR,
                message,
            })
        }
        RpcOutcome::TransportError(message) => Err(Failure {
            code: SERVER_ERROR,
            message,
        }),
    }
}

/// Finds a JSON-RPC error inside a 2xx body.
///
/// Only used for the relay's own `initialize`, whose reply is not forwarded
/// and would otherwise hide a rejected handshake.
fn embedded_error(lines: &[String]) -> Option<Failure> {
    lines.iter().find_map(|line| {
        let value: Value = serde_json::from_str(line).ok()?;
        let error = value.get("error")?;
        Some(Failure {
            code: error
                .get("code")
                .and_then(Value::as_i64)
                .unwrap_or(SERVER_ERROR),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("initialize rejected")
                .to_string(),
        })
    })
}

/// Drives the transport and session manager for each inbound message.
pub struct Orchestrator {
    config: Arc<BridgeConfig>,
    session: SessionManager,
    transport: Arc<dyn RpcTransport>,
}

impl Orchestrator {
    pub fn new(config: Arc<BridgeConfig>, transport: Arc<dyn RpcTransport>) -> Self {
        Self {
            config,
            session: SessionManager::new(),
            transport,
        }
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Handles one input line and returns the lines to write, in order.
    pub async fn handle_line(&self, line: &str) -> Vec<String> {
        match jsonrpc::classify(line) {
            Err(rejection) => {
                debug!(
                    code = rejection.code,
                    id = %rejection.id,
                    "Rejecting inbound line: {}",
                    rejection.message
                );
                vec![rejection.to_reply()]
            }
            Ok(message) => self.handle_message(message).await,
        }
    }

    /// Handles an already classified message.
    pub async fn handle_message(&self, message: RpcMessage) -> Vec<String> {
        let is_initialize = message.is_initialize();
        match message {
            RpcMessage::Notification { method, payload } => {
                self.forward_notification(&method, &payload, is_initialize).await;
                Vec::new()
            }
            RpcMessage::Request {
                id,
                method,
                payload,
            } => self.forward_request(&id, &method, &payload, is_initialize).await,
        }
    }

    /// One attempt: compose headers, send, and record the session of a
    /// successful `initialize`.
    async fn exchange(&self, payload: &Value, is_initialize: bool) -> RpcOutcome {
        let headers = self.session.compose_headers(&self.config, is_initialize);
        let reply = self.transport.send(&headers, payload).await;

        if matches!(reply.outcome, RpcOutcome::Success(_)) {
            self.session.on_response(is_initialize, reply.session_id.as_deref());
        }
        reply.outcome
    }

    /// Notifications get no reply, so a `404` only clears the session; the
    /// next request then runs the recovery.
    async fn forward_notification(&self, method: &str, payload: &Value, is_initialize: bool) {
        debug!(method = %method, "Forwarding notification");
        let outcome = self.exchange(payload, is_initialize).await;
        if matches!(outcome, RpcOutcome::NotFound { .. }) {
            self.session.on_not_found();
        }

        match settle(outcome) {
            Ok(lines) => {
                if !lines.is_empty() {
                    debug!(
                        method = %method,
                        count = lines.len(),
                        "Discarding upstream output for notification"
                    );
                }
            }
            Err(failure) => {
                debug!(
                    method = %method,
                    code = failure.code,
                    "Notification failed upstream: {}",
                    failure.message
                );
            }
        }
    }

    async fn forward_request(
        &self,
        id: &Value,
        method: &str,
        payload: &Value,
        is_initialize: bool,
    ) -> Vec<String> {
        debug!(
            id = %id,
            method = %method,
            with_session = self.session.should_attach_session(is_initialize),
            "Forwarding request"
        );

        match self.exchange(payload, is_initialize).await {
            RpcOutcome::NotFound { .. } => self.recover(id, method, payload, is_initialize).await,
            outcome => match settle(outcome) {
                Ok(lines) => lines,
                Err(failure) => {
                    debug!(id = %id, method = %method, "Request failed: {}", failure.message);
                    vec![failure.reply(id)]
                }
            },
        }
    }

    /// Re-initializes the session and resends `payload` once.
    async fn recover(
        &self,
        id: &Value,
        method: &str,
        payload: &Value,
        is_initialize: bool,
    ) -> Vec<String> {
        info!(id = %id, method = %method, "Session expired; re-initializing");
        self.session.on_not_found();

        if let Err(failure) = self.reinitialize().await {
            warn!(id = %id, "Session re-initialization failed: {}", failure.message);
            return vec![failure.wrap("Session re-initialization failed").reply(id)];
        }

        debug!(id = %id, method = %method, "Session re-established; retrying request");
        match settle(self.exchange(payload, is_initialize).await) {
            Ok(lines) => lines,
            Err(failure) => {
                warn!(
                    id = %id,
                    method = %method,
                    "Retry after re-initialization failed: {}",
                    failure.message
                );
                vec![
                    failure
                        .wrap("Request failed after session re-initialization")
                        .reply(id),
                ]
            }
        }
    }

    async fn reinitialize(&self) -> Result<(), Failure> {
        let initialize = jsonrpc::synthetic_initialize(RECOVERY_INITIALIZE_ID, PROTOCOL_VERSION);
        let lines = settle(self.exchange(&initialize, true).await)?;

        if let Some(failure) = embedded_error(&lines) {
            return Err(failure);
        }
        if !self.session.is_initialized() {
            debug!("Recovery initialize succeeded without a session header");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        headers::{HeaderSet, MCP_SESSION_ID_HEADER},
        jsonrpc::{INVALID_REQUEST, PARSE_ERROR},
        transport::TransportReply,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::{collections::VecDeque, sync::Mutex};
    use url::Url;

    /// Replays canned replies and records every call.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<TransportReply>>,
        calls: Mutex<Vec<(HeaderSet, Value)>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<TransportReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<(HeaderSet, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RpcTransport for ScriptedTransport {
        async fn send(&self, headers: &HeaderSet, body: &Value) -> TransportReply {
            self.calls
                .lock()
                .unwrap()
                .push((headers.clone(), body.clone()));
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| TransportReply::transport_error("script exhausted"))
        }
    }

    fn orchestrator(transport: Arc<ScriptedTransport>) -> Orchestrator {
        let config = BridgeConfig::new(Url::parse("http://upstream.test/mcp").unwrap());
        Orchestrator::new(Arc::new(config), transport)
    }

    fn ok(lines: &[&str]) -> TransportReply {
        TransportReply::new(RpcOutcome::Success(
            lines.iter().map(|l| l.to_string()).collect(),
        ))
    }

    fn not_found() -> TransportReply {
        TransportReply::new(RpcOutcome::NotFound {
            body: "Session not found".to_string(),
        })
    }

    fn parse(line: &str) -> Value {
        serde_json::from_str(line).unwrap()
    }

    const INIT: &str = r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05"}}"#;
    const INIT_OK: &str = r#"{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05"}}"#;

    #[tokio::test]
    async fn parse_error_never_reaches_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let out = orchestrator(transport.clone()).handle_line("{not json").await;

        assert_eq!(out.len(), 1);
        let reply = parse(&out[0]);
        assert_eq!(reply["error"]["code"], PARSE_ERROR);
        assert!(reply["id"].is_null());
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request_echoing_id() {
        let transport = ScriptedTransport::new(vec![]);
        let out = orchestrator(transport.clone())
            .handle_line(r#"{"jsonrpc":"1.0","id":"x","method":"ping"}"#)
            .await;

        let reply = parse(&out[0]);
        assert_eq!(reply["error"]["code"], INVALID_REQUEST);
        assert_eq!(reply["id"], "x");
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn success_lines_are_forwarded_verbatim_in_order() {
        let transport = ScriptedTransport::new(vec![ok(&[r#"{"a":1}"#, r#"{"b":2}"#])]);
        let out = orchestrator(transport)
            .handle_line(r#"{"jsonrpc":"2.0","id":5,"method":"tools/list"}"#)
            .await;
        assert_eq!(out, vec![r#"{"a":1}"#, r#"{"b":2}"#]);
    }

    #[tokio::test]
    async fn request_body_is_forwarded_unchanged() {
        let line = r#"{"jsonrpc":"2.0","id":"q","method":"tools/call","params":{"name":"echo"}}"#;
        let transport = ScriptedTransport::new(vec![ok(&[])]);
        orchestrator(transport.clone()).handle_line(line).await;
        assert_eq!(transport.calls()[0].1, parse(line));
    }

    #[tokio::test]
    async fn notification_failure_produces_no_output() {
        let transport = ScriptedTransport::new(vec![TransportReply::transport_error("refused")]);
        let out = orchestrator(transport.clone())
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#)
            .await;
        assert!(out.is_empty());
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn notification_not_found_clears_session_without_recovery() {
        let transport = ScriptedTransport::new(vec![not_found()]);
        let relay = orchestrator(transport.clone());
        relay.session().on_response(true, Some("S1"));

        let out = relay
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/cancelled"}"#)
            .await;
        assert!(out.is_empty());
        assert_eq!(transport.calls().len(), 1);
        assert_eq!(relay.session().session_id(), None);
    }

    #[tokio::test]
    async fn request_after_notification_not_found_carries_no_stale_session() {
        let transport = ScriptedTransport::new(vec![
            not_found(),
            ok(&[r#"{"jsonrpc":"2.0","id":4,"result":{}}"#]),
        ]);
        let relay = orchestrator(transport.clone());
        relay.session().on_response(true, Some("S1"));

        relay
            .handle_line(r#"{"jsonrpc":"2.0","method":"notifications/cancelled"}"#)
            .await;
        let out = relay
            .handle_line(r#"{"jsonrpc":"2.0","id":4,"method":"tools/list"}"#)
            .await;

        assert_eq!(out.len(), 1);
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(!calls[1].0.contains(MCP_SESSION_ID_HEADER));
    }

    #[tokio::test]
    async fn http_error_uses_default_code_and_request_id() {
        let transport = ScriptedTransport::new(vec![TransportReply::new(RpcOutcome::HttpError {
            status: 500,
            code: None,
            message: "HTTP 500".to_string(),
        })]);
        let out = orchestrator(transport)
            .handle_line(r#"{"jsonrpc":"2.0","id":0,"method":"tools/list"}"#)
            .await;
        assert_eq!(
            parse(&out[0]),
            json!({"jsonrpc":"2.0","error":{"code":-32000,"message":"HTTP 500"},"id":0})
        );
    }

    #[tokio::test]
    async fn upstream_code_is_preserved() {
        let transport = ScriptedTransport::new(vec![TransportReply::new(
            RpcOutcome::ServerRpcError {
                code: Some(-32602),
                message: "Invalid params".to_string(),
            },
        )]);
        let out = orchestrator(transport)
            .handle_line(r#"{"jsonrpc":"2.0","id":"",  "method":"tools/call"}"#)
            .await;
        let reply = parse(&out[0]);
        assert_eq!(reply["error"]["code"], -32602);
        assert_eq!(reply["id"], "");
    }

    #[tokio::test]
    async fn transport_error_becomes_server_error() {
        let transport = ScriptedTransport::new(vec![TransportReply::transport_error(
            "Request timed out after 30s",
        )]);
        let out = orchestrator(transport)
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await;
        let reply = parse(&out[0]);
        assert_eq!(reply["error"]["code"], SERVER_ERROR);
        assert_eq!(reply["error"]["message"], "Request timed out after 30s");
        assert_eq!(reply["id"], 2);
    }

    #[tokio::test]
    async fn initialize_establishes_session_for_later_calls() {
        let transport = ScriptedTransport::new(vec![
            ok(&[INIT_OK]).with_session("S1"),
            ok(&[r#"{"jsonrpc":"2.0","id":2,"result":{}}"#]),
        ]);
        let relay = orchestrator(transport.clone());

        assert_eq!(relay.handle_line(INIT).await, vec![INIT_OK]);
        relay
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await;

        let calls = transport.calls();
        assert!(!calls[0].0.contains(MCP_SESSION_ID_HEADER));
        assert_eq!(calls[1].0.get(MCP_SESSION_ID_HEADER), Some("S1"));
    }

    #[tokio::test]
    async fn session_header_on_other_responses_is_ignored() {
        let transport = ScriptedTransport::new(vec![
            ok(&[INIT_OK]).with_session("S1"),
            ok(&[r#"{"jsonrpc":"2.0","id":2,"result":{}}"#]).with_session("S-other"),
        ]);
        let relay = orchestrator(transport);
        relay.handle_line(INIT).await;
        relay
            .handle_line(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#)
            .await;
        assert_eq!(relay.session().session_id().as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn not_found_reinitializes_and_retries_once() {
        let retried = r#"{"jsonrpc":"2.0","id":"B","result":{"tools":[]}}"#;
        let transport = ScriptedTransport::new(vec![
            ok(&[INIT_OK]).with_session("S1"),
            not_found(),
            ok(&[r#"{"jsonrpc":"2.0","id":0,"result":{}}"#]).with_session("S2"),
            ok(&[retried]),
        ]);
        let relay = orchestrator(transport.clone());
        relay.handle_line(INIT).await;

        let out = relay
            .handle_line(r#"{"jsonrpc":"2.0","id":"B","method":"tools/list"}"#)
            .await;
        assert_eq!(out, vec![retried]);

        let calls = transport.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1].0.get(MCP_SESSION_ID_HEADER), Some("S1"));
        assert_eq!(calls[2].1["method"], "initialize");
        assert_eq!(calls[2].1["id"], RECOVERY_INITIALIZE_ID);
        assert!(!calls[2].0.contains(MCP_SESSION_ID_HEADER));
        assert_eq!(calls[3].1["id"], "B");
        assert_eq!(calls[3].0.get(MCP_SESSION_ID_HEADER), Some("S2"));
        assert_eq!(relay.session().session_id().as_deref(), Some("S2"));
    }

    #[tokio::test]
    async fn second_not_found_is_reported_without_looping() {
        let transport = ScriptedTransport::new(vec![
            not_found(),
            ok(&[r#"{"jsonrpc":"2.0","id":0,"result":{}}"#]).with_session("S2"),
            not_found(),
        ]);
        let out = orchestrator(transport.clone())
            .handle_line(r#"{"jsonrpc":"2.0","id":42,"method":"tools/list"}"#)
            .await;

        assert_eq!(transport.calls().len(), 3);
        assert_eq!(out.len(), 1);
        let reply = parse(&out[0]);
        assert_eq!(reply["id"], 42);
        assert_eq!(reply["error"]["code"], SERVER_ERROR);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .starts_with("Request failed after session re-initialization")
        );
    }

    #[tokio::test]
    async fn failed_reinitialize_reports_with_original_id() {
        let transport = ScriptedTransport::new(vec![
            not_found(),
            TransportReply::transport_error("connection refused"),
        ]);
        let relay = orchestrator(transport.clone());
        let out = relay
            .handle_line(r#"{"jsonrpc":"2.0","id":"orig","method":"tools/list"}"#)
            .await;

        assert_eq!(transport.calls().len(), 2);
        let reply = parse(&out[0]);
        assert_eq!(reply["id"], "orig");
        assert_eq!(
            reply["error"]["message"],
            "Session re-initialization failed: connection refused"
        );
        assert!(!relay.session().is_initialized());
    }

    #[tokio::test]
    async fn reinitialize_rejected_in_success_body_is_a_failure() {
        let transport = ScriptedTransport::new(vec![
            not_found(),
            ok(&[r#"{"jsonrpc":"2.0","id":0,"error":{"code":-32603,"message":"no more sessions"}}"#]),
        ]);
        let out = orchestrator(transport.clone())
            .handle_line(r#"{"jsonrpc":"2.0","id":9,"method":"tools/list"}"#)
            .await;

        assert_eq!(transport.calls().len(), 2);
        let reply = parse(&out[0]);
        assert_eq!(reply["id"], 9);
        assert_eq!(reply["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn recovery_output_excludes_synthetic_initialize() {
        let transport = ScriptedTransport::new(vec![
            not_found(),
            ok(&[r#"{"jsonrpc":"2.0","id":0,"result":{"serverInfo":{}}}"#]).with_session("S9"),
            ok(&[r#"{"jsonrpc":"2.0","id":7,"result":{}}"#]),
        ]);
        let out = orchestrator(transport)
            .handle_line(r#"{"jsonrpc":"2.0","id":7,"method":"ping"}"#)
            .await;
        assert_eq!(out.len(), 1);
        assert_eq!(parse(&out[0])["id"], 7);
    }
}
