//! Classification of inbound JSON-RPC 2.0 lines and construction of locally
//! generated error replies.

use serde::Serialize;
use serde_json::{Map, Value};

// JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
/// Implementation-defined server error, used whenever upstream gives no code.
pub const SERVER_ERROR: i64 = -32000;

pub const JSONRPC_VERSION: &str = "2.0";

/// Method name of the MCP handshake request.
pub const INITIALIZE_METHOD: &str = "initialize";

/// An inbound message after shape validation.
///
/// `payload` is the original JSON object and is forwarded upstream untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Has `method` and an `id` member. The id may be any JSON value,
    /// including `null`, `0` and `""`.
    Request {
        id: Value,
        method: String,
        payload: Value,
    },
    /// Has `method` and no `id` member. Never answered.
    Notification { method: String, payload: Value },
}

impl RpcMessage {
    pub fn method(&self) -> &str {
        match self {
            Self::Request { method, .. } | Self::Notification { method, .. } => method,
        }
    }

    pub fn is_initialize(&self) -> bool {
        self.method() == INITIALIZE_METHOD
    }
}

/// Why a line could not be turned into an [`RpcMessage`].
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub code: i64,
    pub message: String,
    /// Id to echo back; `null` when the line had none or was not JSON.
    pub id: Value,
}

impl Rejection {
    fn parse_error() -> Self {
        Self {
            code: PARSE_ERROR,
            message: "Parse error".to_string(),
            id: Value::Null,
        }
    }

    fn invalid_request(id: Value, detail: &str) -> Self {
        Self {
            code: INVALID_REQUEST,
            message: format!("Invalid Request: {}", detail),
            id,
        }
    }

    pub fn to_reply(&self) -> String {
        error_reply(self.id.clone(), self.code, &self.message)
    }
}

/// Classifies one input line.
///
/// Parse failures never carry an id. Shape violations echo the id when the
/// object has one.
pub fn classify(line: &str) -> Result<RpcMessage, Rejection> {
    let payload: Value = serde_json::from_str(line).map_err(|_| Rejection::parse_error())?;

    let Some(obj) = payload.as_object() else {
        return Err(Rejection::invalid_request(
            Value::Null,
            "expected a JSON object",
        ));
    };

    let id = obj.get("id").cloned();
    let echo_id = || id.clone().unwrap_or(Value::Null);

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
        return Err(Rejection::invalid_request(
            echo_id(),
            "jsonrpc must be \"2.0\"",
        ));
    }

    let method = match obj.get("method") {
        Some(Value::String(method)) => method.clone(),
        Some(_) => {
            return Err(Rejection::invalid_request(
                echo_id(),
                "method must be a string",
            ));
        }
        None => {
            return Err(Rejection::invalid_request(
                echo_id(),
                "missing method field",
            ));
        }
    };

    Ok(match id {
        Some(id) => RpcMessage::Request {
            id,
            method,
            payload,
        },
        None => RpcMessage::Notification { method, payload },
    })
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: i64,
    message: &'a str,
}

#[derive(Serialize)]
struct ErrorReply<'a> {
    jsonrpc: &'static str,
    error: ErrorBody<'a>,
    id: Value,
}

/// Serializes `{"jsonrpc":"2.0","error":{"code":..,"message":..},"id":..}`.
pub fn error_reply(id: Value, code: i64, message: &str) -> String {
    let reply = ErrorReply {
        jsonrpc: JSONRPC_VERSION,
        error: ErrorBody { code, message },
        id,
    };
    // Serializing plain strings, integers and an existing Value cannot fail.
    serde_json::to_string(&reply).unwrap_or_else(|_| {
        format!(
            r#"{{"jsonrpc":"2.0","error":{{"code":{}}},"id":null}}"#,
            code
        )
    })
}

/// Builds the `initialize` request the relay sends on its own behalf when it
/// re-establishes an expired session.
pub fn synthetic_initialize(id: i64, protocol_version: &str) -> Value {
    let mut client_info = Map::new();
    client_info.insert("name".into(), env!("CARGO_PKG_NAME").into());
    client_info.insert("version".into(), env!("CARGO_PKG_VERSION").into());

    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": INITIALIZE_METHOD,
        "params": {
            "protocolVersion": protocol_version,
            "capabilities": {},
            "clientInfo": client_info,
        }
    })
}
