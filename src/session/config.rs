use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use directories::ProjectDirs;
use url::Url;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_POLL_RETRIES: u32 = 3;
const DEFAULT_BLOCK_CONCURRENCY: usize = 3;
const DEFAULT_COMMAND_QUEUE_DEPTH: usize = 16;
const DOWNLOAD_DIR_NAME: &str = "blocks";

/// Settings for one scanner session.
#[derive(Debug, Clone, Builder)]
pub struct SessionConfig {
    /// Scanner root (direct) or cloud scanner URL.
    scanner_url: Url,
    /// Directory receiving block part files and assembled images.
    #[builder(default = default_download_dir())]
    download_dir: PathBuf,
    /// Deadline for ordinary commands, including cloud-relayed replies.
    #[builder(default = DEFAULT_COMMAND_TIMEOUT)]
    command_timeout: Duration,
    /// Read deadline for one `waitForEvents` long poll.
    #[builder(default = DEFAULT_POLL_TIMEOUT)]
    poll_timeout: Duration,
    #[builder(default = DEFAULT_POLL_INTERVAL)]
    poll_interval: Duration,
    /// Consecutive non-timeout poll failures tolerated before giving up.
    #[builder(default = DEFAULT_POLL_RETRIES)]
    poll_retries: u32,
    #[builder(default = DEFAULT_BLOCK_CONCURRENCY)]
    block_concurrency: usize,
    #[builder(default = DEFAULT_COMMAND_QUEUE_DEPTH)]
    command_queue_depth: usize,
}

impl SessionConfig {
    #[must_use]
    pub fn scanner_url(&self) -> &Url {
        &self.scanner_url
    }

    #[must_use]
    pub fn download_dir(&self) -> &PathBuf {
        &self.download_dir
    }

    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[must_use]
    pub fn poll_retries(&self) -> u32 {
        self.poll_retries
    }

    #[must_use]
    pub fn block_concurrency(&self) -> usize {
        self.block_concurrency
    }

    #[must_use]
    pub fn command_queue_depth(&self) -> usize {
        self.command_queue_depth.max(1)
    }
}

/// Per-user cache directory, or the system temp dir when none is known.
#[must_use]
pub fn default_download_dir() -> PathBuf {
    let Some(project_dirs) = ProjectDirs::from("org", "TWAIN", "twaindirect") else {
        return std::env::temp_dir().join("twaindirect").join(DOWNLOAD_DIR_NAME);
    };
    project_dirs.cache_dir().join(DOWNLOAD_DIR_NAME)
}
