//! Error types for the stdio relay

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("{0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;

/// Why a single HTTP attempt produced no response.
///
/// Only ever reported to the client as the message of a JSON-RPC error.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid header name '{0}'")]
    InvalidHeaderName(String),

    #[error("Invalid value for header '{0}'")]
    InvalidHeaderValue(String),

    #[error("{}", error_chain(.0))]
    Request(#[from] reqwest::Error),

    #[error("Request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

/// Renders an error followed by its sources, `outer: inner: root`.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
