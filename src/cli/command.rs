use std::path::{Path, PathBuf};
use std::time::Duration;

use bon::Builder;
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;
use url::Url;

use crate::error::CliConfigError;
use crate::transport::fake_scanner::{FAKE_CLOUD_API_ROOT, FAKE_SCANNER_URL};

const FAKE_CLOUD_TOKEN: &str = "fake-cloud-token";

/// Command-line options for the TWAIN Direct client.
#[derive(Debug, Parser)]
#[command(
    name = "twaindirect",
    about = "Scan from TWAIN Direct scanners, directly or through TWAIN Cloud."
)]
pub struct Args {
    /// Log verbosity; overrides `RUST_LOG`.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Talks to a simulated scanner instead of the network.
    #[arg(long, global = true)]
    fake: bool,
    /// Number of images the simulated scanner captures.
    #[arg(long, global = true, requires = "fake")]
    fake_images: Option<u32>,
    /// Number of blocks each simulated image is split into.
    #[arg(long, global = true, requires = "fake")]
    fake_parts: Option<u32>,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use twaindirect::{Args, Command, InfoArgs};
    ///
    /// let args = Args::new(Command::Info(InfoArgs::new(None)));
    /// let _ = args;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            fake: false,
            fake_images: None,
            fake_parts: None,
            command,
        }
    }

    /// Enables the simulated scanner.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        self.fake = true;
        self.fake_images = Some(fake.images);
        self.fake_parts = Some(fake.parts);
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    /// Splits parsed arguments into the command and optional fake-scanner
    /// settings.
    ///
    /// In fake mode, missing scanner and cloud addresses default to the
    /// simulated ones.
    ///
    /// # Errors
    ///
    /// Returns an error when a real run lacks a required address.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_images,
            fake_parts,
            mut command,
            ..
        } = self;

        if !fake {
            command.validate()?;
            return Ok((command, None));
        }

        command.fill_fake_defaults()?;
        let fake_args = FakeArgs::builder()
            .maybe_images(fake_images)
            .maybe_parts(fake_parts)
            .build();
        Ok((command, Some(fake_args)))
    }
}

/// Log verbosity accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Simulated scanner settings for programmatic runs.
#[derive(Debug, Clone, Copy, Builder)]
pub struct FakeArgs {
    #[builder(default = 2)]
    images: u32,
    #[builder(default = 2)]
    parts: u32,
}

impl FakeArgs {
    #[must_use]
    pub fn images(&self) -> u32 {
        self.images
    }

    #[must_use]
    pub fn parts(&self) -> u32 {
        self.parts
    }
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print a scanner's `/privet/infoex` description.
    Info(InfoArgs),
    /// Open a session, send a task, capture and save every image.
    Scan(ScanArgs),
    /// List the scanners registered with a TWAIN Cloud account.
    Scanners(ScannersArgs),
}

impl Command {
    fn validate(&self) -> Result<(), CliConfigError> {
        match self {
            Self::Info(args) => args.scanner_url().map(|_url| ()),
            Self::Scan(args) => args.scanner_url().map(|_url| ()),
            Self::Scanners(args) => args.credentials().map(|_credentials| ()),
        }
    }

    fn fill_fake_defaults(&mut self) -> Result<(), url::ParseError> {
        match self {
            Self::Info(args) => {
                args.url.get_or_insert(Url::parse(FAKE_SCANNER_URL)?);
            }
            Self::Scan(args) => {
                args.url.get_or_insert(Url::parse(FAKE_SCANNER_URL)?);
            }
            Self::Scanners(args) => {
                args.api_root.get_or_insert(Url::parse(FAKE_CLOUD_API_ROOT)?);
                args.token.get_or_insert_with(|| FAKE_CLOUD_TOKEN.to_string());
            }
        }
        Ok(())
    }
}

/// Arguments for the `info` command.
#[derive(Debug, ClapArgs)]
pub struct InfoArgs {
    /// Scanner root URL, e.g. `http://192.168.1.20:34034/`.
    #[arg(long)]
    url: Option<Url>,
}

impl InfoArgs {
    #[must_use]
    pub fn new(url: Option<Url>) -> Self {
        Self { url }
    }

    pub(crate) fn scanner_url(&self) -> Result<&Url, CliConfigError> {
        self.url.as_ref().ok_or(CliConfigError::MissingScannerUrl)
    }
}

/// Arguments for the `scan` command.
#[derive(Debug, ClapArgs)]
pub struct ScanArgs {
    /// Scanner root URL, e.g. `http://192.168.1.20:34034/`.
    #[arg(long)]
    url: Option<Url>,
    /// Task document (JSON) to send; defaults to an empty task.
    #[arg(long)]
    task: Option<PathBuf>,
    /// Directory that receives the assembled images.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Long-poll deadline for `waitForEvents` (e.g. `30s`).
    #[arg(long, value_parser = parse_duration)]
    poll_timeout: Option<Duration>,
}

impl ScanArgs {
    pub(crate) fn scanner_url(&self) -> Result<&Url, CliConfigError> {
        self.url.as_ref().ok_or(CliConfigError::MissingScannerUrl)
    }

    pub(crate) fn task_path(&self) -> Option<&Path> {
        self.task.as_deref()
    }

    pub(crate) fn out_dir(&self) -> Option<&Path> {
        self.out.as_deref()
    }

    pub(crate) fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout
    }
}

/// Arguments for the `scanners` command.
#[derive(Debug, ClapArgs)]
pub struct ScannersArgs {
    /// TWAIN Cloud API root, e.g. `https://cloud.example/api/`.
    #[arg(long)]
    api_root: Option<Url>,
    /// Access token sent as the `Authorization` header.
    #[arg(long)]
    token: Option<String>,
}

impl ScannersArgs {
    #[must_use]
    pub fn new(api_root: Option<Url>, token: Option<String>) -> Self {
        Self { api_root, token }
    }

    pub(crate) fn credentials(&self) -> Result<(&Url, &str), CliConfigError> {
        match (&self.api_root, &self.token) {
            (Some(api_root), Some(token)) => Ok((api_root, token)),
            _ => Err(CliConfigError::MissingCloudCredentials),
        }
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn fake_sizing_flags_require_fake_mode() {
        let result = Args::try_parse_from(["twaindirect", "--fake-images", "3", "info"]);

        let error = result.expect_err("--fake-images should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn real_mode_requires_a_scanner_url() {
        let args = Args::try_parse_from(["twaindirect", "scan"]).expect("arguments should parse");

        let error = args
            .into_command_and_fake_args()
            .expect_err("scan without --url should fail");
        assert_matches!(
            error.downcast_ref::<CliConfigError>(),
            Some(CliConfigError::MissingScannerUrl)
        );
    }

    #[test]
    fn fake_mode_fills_in_the_simulated_scanner() {
        let args = Args::try_parse_from([
            "twaindirect",
            "--fake",
            "--fake-images",
            "3",
            "scan",
            "--poll-timeout",
            "250ms",
        ])
        .expect("valid fake arguments should parse");

        let (command, fake_args) = args
            .into_command_and_fake_args()
            .expect("fake arguments should resolve");

        let fake_args = fake_args.expect("fake mode yields fake settings");
        assert_eq!((3, 2), (fake_args.images(), fake_args.parts()));
        assert_matches!(command, Command::Scan(scan) => {
            assert_eq!(Some(FAKE_SCANNER_URL), scan.url.as_ref().map(Url::as_str));
            assert_eq!(Some(Duration::from_millis(250)), scan.poll_timeout());
        });
    }

    #[test]
    fn log_level_is_global() {
        let args = Args::try_parse_from(["twaindirect", "info", "--log-level", "debug"])
            .expect("global flag should parse after the subcommand");

        assert_eq!(Some(LogLevel::Debug), args.log_level());
        assert_eq!(LevelFilter::DEBUG, LogLevel::Debug.as_level_filter());
    }
}
