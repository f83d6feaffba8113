//! # Diagnostic Logging
//!
//! stdout carries nothing but JSON-RPC lines, so all diagnostics go to stderr
//! through a `tracing` subscriber.
//!
//! - `RUST_LOG`, when set, always decides the filter.
//! - Otherwise the debug flag selects `mcp_relay=debug,info`; without it the
//!   subscriber is installed with everything turned off.
//!
//! Initialization happens once per process; later calls are no-ops.

use std::{io::stderr, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(debug: bool) -> &'static str {
    if debug { "mcp_relay=debug,info" } else { "off" }
}

/// Installs the stderr subscriber.
pub fn init_logging(debug: bool) {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(false).with_target(false))
            .try_init();

        if let Err(e) = result {
            eprintln!("mcp_relay: failed to initialize logging: {}", e);
        }
    });
}

/// Verbose stderr logging for tests.
pub fn init_test_logging() {
    init_logging(true);
}
