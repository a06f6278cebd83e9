use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::error::{CliConfigError, ConnectionError};
use crate::notification::SessionEvent;
use crate::session::{Session, SessionConfig};
use crate::terminal::TerminalClient;
use crate::transport::http::HttpClient;

use super::command::ScanArgs;
use super::ui::{Painter, SessionEventView};

/// Executes the `scan` command.
///
/// Runs one capture to completion. Ctrl+C or a failed block download closes
/// the session early; either way the command waits for the scanner to
/// finish releasing blocks.
pub(crate) async fn run<W>(
    http: Arc<dyn HttpClient>,
    args: &ScanArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let task = load_task(args.task_path()).await?;
    let config = SessionConfig::builder()
        .scanner_url(args.scanner_url()?.clone())
        .maybe_download_dir(args.out_dir().map(Path::to_path_buf))
        .maybe_poll_timeout(args.poll_timeout())
        .build();
    let download_dir = config.download_dir().clone();

    let (session, mut events) = Session::new(config, http);
    session.open().await?;
    let accepted = session.send_task(task).await?;
    debug!(%accepted, "scanner accepted task");
    session.start_capturing().await?;
    writeln!(
        out,
        "{} {}",
        painter.heading("Scanning into"),
        painter.value(download_dir.display().to_string())
    )?;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut closing = false;
    let mut images = 0usize;
    let mut failed_blocks = 0usize;

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            result = &mut interrupted, if !closing => {
                result?;
                closing = true;
                writeln!(out, "{}", painter.warning("interrupted, closing session"))?;
                session.close().await?;
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };
        writeln!(out, "{}", SessionEventView::new(&event, &painter))?;

        match event {
            SessionEvent::ImageReceived(_image) => images += 1,
            SessionEvent::DoneCapturing => break,
            SessionEvent::ConnectionError(ConnectionError::BlockDownload { block, .. }) => {
                failed_blocks += 1;
                if !closing {
                    warn!(block, "giving up on capture after a failed block");
                    closing = true;
                    session.close().await?;
                }
            }
            SessionEvent::ConnectionError(error) => return Err(error.into()),
            SessionEvent::StateChanged { .. } | SessionEvent::StatusChanged { .. } => {}
        }
    }

    info!(images, failed_blocks, "scan finished");
    writeln!(
        out,
        "{} {}",
        painter.success("Saved"),
        painter.value(format!("{images} image(s)"))
    )?;
    if failed_blocks > 0 {
        bail!("{failed_blocks} image block(s) failed to download");
    }
    Ok(())
}

/// Reads the task document, or returns a task with a single default
/// `configure` action.
async fn load_task(path: Option<&Path>) -> Result<Value, CliConfigError> {
    let Some(path) = path else {
        return Ok(json!({"actions": [{"action": "configure"}]}));
    };
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| CliConfigError::TaskIo {
            path: path.display().to_string(),
            source,
        })?;
    serde_json::from_str(&text).map_err(|source| CliConfigError::TaskJson {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn missing_task_file_defaults_to_configure() -> Result<()> {
        let task = load_task(None).await?;

        assert_eq!(json!({"actions": [{"action": "configure"}]}), task);
        Ok(())
    }

    #[tokio::test]
    async fn malformed_task_file_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("task.json");
        std::fs::write(&path, "{not json")?;

        let result = load_task(Some(&path)).await;

        assert_matches!(result, Err(CliConfigError::TaskJson { .. }));
        Ok(())
    }
}
