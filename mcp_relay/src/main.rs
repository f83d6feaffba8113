use anyhow::Context;
use clap::{Parser, error::ErrorKind};
use mcp_relay::{
    Args, BridgeConfig,
    config::parse_flag,
    jsonrpc::{SERVER_ERROR, error_reply},
    logging::init_logging,
    run_stdio,
};
use serde_json::Value;
use std::{io::Write, process::ExitCode};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            emit_fatal(e.to_string().trim());
            return ExitCode::FAILURE;
        }
    };

    // Configuration problems are logged too, so logging starts before the
    // config is validated.
    init_logging(parse_flag(args.debug.as_deref()));

    let config = match BridgeConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            emit_fatal(&e.to_string());
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = relay(config) => match result {
            Ok(()) => {
                info!("Input closed; exiting");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("mcp_relay fatal error: {:#}", e);
                ExitCode::FAILURE
            }
        },
        signal = shutdown_signal() => {
            info!(signal = signal, "Termination signal received; exiting");
            // In-flight requests and the blocking stdin reader are abandoned.
            let _ = std::io::stdout().flush();
            std::process::exit(0);
        }
    }
}

async fn relay(config: BridgeConfig) -> anyhow::Result<()> {
    run_stdio(config).await.context("stdio relay stopped")
}

/// Writes the single JSON-RPC error line reported for a fatal startup problem.
fn emit_fatal(message: &str) {
    let line = error_reply(Value::Null, SERVER_ERROR, message);
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", line);
    let _ = stdout.flush();
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return "SIGINT";
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
