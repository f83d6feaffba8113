//! Newline-delimited JSON-RPC over a byte stream pair.
//!
//! Each inbound line is dispatched on its own task, so a slow upstream call
//! never holds up the lines behind it. All output goes through one writer
//! task; the lines produced for one message are written together and flushed,
//! so no two messages can interleave inside a line.

use crate::{
    error::{RelayError, Result},
    jsonrpc::{PARSE_ERROR, error_reply},
    orchestrator::Orchestrator,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, error};

/// What to do with requests still in flight when the input ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EofPolicy {
    /// Stop at once; in-flight upstream calls are dropped.
    #[default]
    Abandon,
    /// Wait for every in-flight message to produce its output.
    Drain,
}

impl EofPolicy {
    pub fn from_drain_flag(drain: bool) -> Self {
        if drain { Self::Drain } else { Self::Abandon }
    }
}

/// Reads messages from `reader` until end of input, writing replies to `writer`.
///
/// # Errors
///
/// Returns an error if reading the input or writing the output fails.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    orchestrator: Arc<Orchestrator>,
    eof: EofPolicy,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Vec<String>>();
    let writer_task = tokio::spawn(write_batches(writer, rx));

    let mut in_flight = JoinSet::new();
    let mut segments = reader.split(b'\n');

    while let Some(raw) = segments.next_segment().await? {
        reap_finished(&mut in_flight);

        let line = match String::from_utf8(raw) {
            Ok(line) => line,
            Err(_) => {
                debug!("Input line is not valid UTF-8");
                let _ = tx.send(vec![error_reply(Value::Null, PARSE_ERROR, "Parse error")]);
                continue;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let orchestrator = orchestrator.clone();
        let tx = tx.clone();
        let line = line.to_string();
        in_flight.spawn(async move {
            let output = orchestrator.handle_line(&line).await;
            if !output.is_empty() && tx.send(output).is_err() {
                debug!("Output closed; dropping reply");
            }
        });
    }

    debug!(in_flight = in_flight.len(), policy = ?eof, "End of input");
    match eof {
        EofPolicy::Abandon => in_flight.abort_all(),
        EofPolicy::Drain => {
            while let Some(result) = in_flight.join_next().await {
                log_task_failure(result);
            }
        }
    }

    // The writer stops once every sender is gone, after flushing what is queued.
    drop(tx);
    drop(in_flight);
    writer_task
        .await
        .map_err(|e| RelayError::Io(std::io::Error::other(e)))??;
    Ok(())
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.try_join_next() {
        log_task_failure(result);
    }
}

fn log_task_failure(result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result
        && e.is_panic()
    {
        error!("Message handler panicked: {}", e);
    }
}

async fn write_batches<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Vec<String>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(batch) = rx.recv().await {
        for line in batch {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
    }
    writer.flush().await?;
    Ok(())
}
