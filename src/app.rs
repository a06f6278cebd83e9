use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::instrument;

use crate::cli::{Command, FakeArgs, LogLevel};
use crate::cloud::pubsub::ChannelPubSub;
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};
use crate::transport::fake_scanner::{FakeCloudRelay, FakeScanner};
use crate::transport::http::{HttpClient, ReqwestHttpClient};

const FAKE_RELAY_TOPIC: &str = "twaindirect/fake/responses";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Creates an HTTP client that talks to real scanners and cloud services.
///
/// # Errors
///
/// Returns an error if the HTTP client cannot be built.
pub fn real_http_client() -> Result<Arc<dyn HttpClient>> {
    let client = ReqwestHttpClient::new(CONNECT_TIMEOUT)
        .context("failed to build the HTTP client")?;
    Ok(Arc::new(client))
}

/// Creates an HTTP client answered by a simulated scanner.
///
/// The simulated scanner answers at its direct address and behind the fake
/// cloud API root.
#[must_use]
pub fn fake_http_client(fake_args: FakeArgs) -> Arc<dyn HttpClient> {
    let relay = FakeCloudRelay {
        publisher: ChannelPubSub::new().publisher(),
        topic: FAKE_RELAY_TOPIC.to_string(),
    };
    Arc::new(
        FakeScanner::builder()
            .images(fake_args.images())
            .parts_per_image(fake_args.parts())
            .cloud(relay)
            .build(),
    )
}

/// Runs the CLI command with an injected HTTP client.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = twaindirect::Args::try_parse_from(["twaindirect", "--fake", "info"])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let http = match maybe_fake_args {
///     Some(fake_args) => twaindirect::fake_http_client(fake_args),
///     None => twaindirect::real_http_client()?,
/// };
/// let mut out = Vec::new();
/// twaindirect::run(command, &mut out, http).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the scanner interaction
/// fails, or output writing fails.
pub async fn run<W>(command: Command, out: &mut W, http: Arc<dyn HttpClient>) -> Result<()>
where
    W: io::Write,
{
    run_with_log_level(command, out, http, None).await
}

/// Runs the CLI command with an explicit telemetry log-level override.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = twaindirect::Args::try_parse_from([
///     "twaindirect",
///     "--log-level",
///     "debug",
///     "--fake",
///     "scanners",
/// ])?;
/// let log_level = args.log_level();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let http = match maybe_fake_args {
///     Some(fake_args) => twaindirect::fake_http_client(fake_args),
///     None => twaindirect::real_http_client()?,
/// };
/// let mut out = Vec::new();
/// twaindirect::run_with_log_level(command, &mut out, http, log_level).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the scanner interaction
/// fails, or output writing fails.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    http: Arc<dyn HttpClient>,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(command, out, &SystemTerminalClient, http, log_level).await
}

/// Runs the CLI command with injected clients.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the scanner interaction
/// fails, or output writing fails.
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    http: Arc<dyn HttpClient>,
) -> Result<()>
where
    W: io::Write,
{
    run_with_clients_and_log_level(command, out, terminal_client, http, None).await
}

/// Runs the CLI command with injected clients and explicit telemetry settings.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, the scanner interaction
/// fails, or output writing fails.
#[instrument(
    skip(out, terminal_client, http),
    level = "info",
    fields(command = %command_name(&command), ?log_level)
)]
pub async fn run_with_clients_and_log_level<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    http: Arc<dyn HttpClient>,
    log_level: Option<LogLevel>,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "twaindirect",
        terminal_client.stderr_is_terminal(),
        log_level.map(LogLevel::as_level_filter),
    )?;

    match command {
        Command::Info(args) => crate::cli::info::run(http, &args, out, terminal_client).await,
        Command::Scan(args) => crate::cli::scan::run(http, &args, out, terminal_client).await,
        Command::Scanners(args) => {
            crate::cli::scanners::run(http, &args, out, terminal_client).await
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Info(_args) => "info",
        Command::Scan(_args) => "scan",
        Command::Scanners(_args) => "scanners",
    }
}
