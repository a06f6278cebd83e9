use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::session::discover_device;
use crate::terminal::TerminalClient;
use crate::transport::http::HttpClient;

use super::command::InfoArgs;
use super::ui::{DeviceInfoView, Painter};

const INFO_TIMEOUT: Duration = Duration::from_secs(15);

/// Executes the `info` command.
pub(crate) async fn run<W>(
    http: Arc<dyn HttpClient>,
    args: &InfoArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let url = args.scanner_url()?;
    let info = discover_device(http, url, INFO_TIMEOUT).await?;
    writeln!(out, "{}", DeviceInfoView::new(url, &info, &painter))?;
    Ok(())
}
