use std::io;
use std::sync::Arc;

use anyhow::Result;

use crate::cloud::connection::CloudConnection;
use crate::terminal::TerminalClient;
use crate::transport::http::HttpClient;

use super::command::ScannersArgs;
use super::ui::{Painter, ScannerListView};

/// Executes the `scanners` command.
pub(crate) async fn run<W>(
    http: Arc<dyn HttpClient>,
    args: &ScannersArgs,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
) -> Result<()>
where
    W: io::Write,
{
    let painter = Painter::new(terminal_client.stdout_is_terminal());
    let (api_root, token) = args.credentials()?;
    let connection = CloudConnection::new(api_root.clone(), token, http);
    let scanners = connection.scanners().await?;
    writeln!(out, "{}", ScannerListView::new(&scanners, &painter))?;
    Ok(())
}
