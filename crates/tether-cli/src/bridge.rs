//! NDJSON bridge between stdio and the session supervisor.
//!
//! Each stdin line is one [`UiCommand`]; each stdout line is one
//! [`BoundaryEvent`]. Malformed input lines are logged and skipped.

use anyhow::{Context, Result};
use tether_adapters::SessionSupervisor;
use tether_proto::{BoundaryEvent, UiCommand};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long to keep relaying events after shutdown was requested.
const FLUSH_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Serves commands from `input` until EOF, Ctrl-C, or the end of
/// `exit_with`'s session.
///
/// Every live session is aborted before returning, and their final events
/// are still written to `output`.
pub async fn serve<R, W>(
    supervisor: SessionSupervisor,
    events: mpsc::UnboundedReceiver<BoundaryEvent>,
    input: R,
    output: W,
    exit_with: Option<String>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (ended_tx, mut ended_rx) = oneshot::channel();
    let writer = tokio::spawn(write_events(events, output, exit_with, ended_tx));

    let mut lines = input.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("Failed to read command from stdin")? {
                    Some(line) => dispatch(&supervisor, &line).await,
                    None => {
                        debug!("Input closed");
                        break;
                    }
                }
            }
            _ = &mut ended_rx => {
                debug!("Watched session ended");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }
    }

    supervisor.abort_all().await;
    drop(supervisor);

    match tokio::time::timeout(FLUSH_TIMEOUT, writer).await {
        Ok(joined) => joined.context("Event writer panicked")??,
        Err(_) => warn!("Timed out flushing final session events"),
    }
    Ok(())
}

async fn dispatch(supervisor: &SessionSupervisor, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let command: UiCommand = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            warn!("Ignoring malformed command: {e}");
            return;
        }
    };
    debug!(?command, "Command received");

    match command {
        UiCommand::Start {
            session_id,
            options,
        } => {
            // Failures are already reported as session:error.
            if let Err(e) = supervisor.start(&session_id, options).await {
                warn!(session_id = %session_id, "Start failed: {e}");
            }
        }
        UiCommand::Send {
            session_id,
            text,
            images,
        } => supervisor.send(&session_id, &text, &images).await,
        UiCommand::Respond {
            session_id,
            decision,
        } => supervisor.respond(&session_id, decision).await,
        UiCommand::Abort { session_id } => supervisor.abort(&session_id).await,
    }
}

/// Writes events until every sender is gone.
async fn write_events<W>(
    mut events: mpsc::UnboundedReceiver<BoundaryEvent>,
    mut output: W,
    exit_with: Option<String>,
    ended: oneshot::Sender<()>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut ended = Some(ended);
    while let Some(event) = events.recv().await {
        let mut line = serde_json::to_string(&event).context("Failed to encode event")?;
        line.push('\n');
        output
            .write_all(line.as_bytes())
            .await
            .context("Failed to write event")?;
        output.flush().await.context("Failed to flush events")?;

        if event.is_terminal()
            && exit_with.as_deref() == Some(event.session_id())
            && let Some(ended) = ended.take()
        {
            let _ = ended.send(());
        }
    }
    Ok(())
}
