//! # MCP Relay
//!
//! Bridges a client that speaks newline-delimited JSON-RPC on stdin/stdout to
//! an MCP server reachable over HTTP POST.
//!
//! ## Architecture
//!
//! *   **Line protocol** ([`stdio`]): one JSON-RPC message per input line; every
//!     output line is either a forwarded upstream message or a locally built
//!     JSON-RPC error. Diagnostics never touch stdout.
//! *   **Orchestrator** ([`orchestrator`]): classifies each message, forwards it,
//!     and recovers from an expired session by re-running `initialize` and
//!     retrying the original request exactly once.
//! *   **Session** ([`session`]): holds the single upstream `Mcp-Session-Id`,
//!     learned from `initialize` responses and cleared on `404`.
//! *   **Transport** ([`transport`]): one POST per attempt with a bounded
//!     timeout, classifying the response into an [`RpcOutcome`].
//! *   **Headers** ([`headers`]): content type, bearer token, custom headers and
//!     the session header, composed fresh for every attempt.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_relay::{BridgeConfig, run_stdio};
//! use std::time::Duration;
//! use url::Url;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::new(Url::parse("https://example.com/mcp")?)
//!         .with_bearer_token("secret")
//!         .with_header("X-Client", "docs")
//!         .with_timeout(Duration::from_secs(10));
//!
//!     run_stdio(config).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod headers;
pub mod jsonrpc;
pub mod logging;
pub mod orchestrator;
pub mod session;
pub mod stdio;
pub mod transport;

pub use config::{Args, BridgeConfig};
pub use error::{RelayError, Result, SendError};
pub use headers::HeaderSet;
pub use orchestrator::Orchestrator;
pub use session::{SessionManager, SessionState};
pub use stdio::{EofPolicy, serve};
pub use transport::{HttpTransport, RpcOutcome, RpcTransport, TransportReply};

use std::sync::Arc;
use tracing::info;

/// Runs the relay on the process's stdin and stdout until end of input.
///
/// Installs the stderr diagnostics subscriber from `config.debug` unless one
/// is already in place.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built or stdio fails.
pub async fn run_stdio(config: BridgeConfig) -> Result<()> {
    logging::init_logging(config.debug);

    let transport = HttpTransport::new(config.endpoint.clone(), config.request_timeout)?;
    let eof = EofPolicy::from_drain_flag(config.drain_on_eof);

    info!(
        endpoint = %config.endpoint,
        timeout_secs = config.request_timeout.as_secs(),
        custom_headers = config.custom_headers.len(),
        bearer = config.bearer_token.is_some(),
        "Starting stdio relay"
    );

    let orchestrator = Arc::new(Orchestrator::new(Arc::new(config), Arc::new(transport)));
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    serve(stdin, tokio::io::stdout(), orchestrator, eof).await
}
