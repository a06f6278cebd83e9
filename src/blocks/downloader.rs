use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use url::Url;

use super::assembler::{AssembledImage, BlockAssembler, DownloadedBlock};
use super::multipart;
use crate::error::{ConnectionError, DecodeError, TransportError, TwainError};
use crate::protocol::{BlockMetadata, CommandEnvelope, CommandMethod, command_results};
use crate::transport::command::CommandTransport;
use crate::uri::append_path;

/// Where and how blocks are fetched for one capture.
#[derive(Debug, Clone)]
pub(crate) struct BlockSource {
    pub(crate) transport: CommandTransport,
    pub(crate) endpoint: Url,
    pub(crate) scanner_url: Url,
    pub(crate) privet_token: String,
    pub(crate) session_id: String,
    pub(crate) timeout: Duration,
}

/// An image written to disk, ready to be reported and released.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImageFile {
    pub(crate) path: PathBuf,
    pub(crate) metadata: BlockMetadata,
    pub(crate) first: u32,
    pub(crate) last: u32,
}

/// Items sent from the downloader to the session.
#[derive(Debug)]
pub(crate) enum DownloaderOutput {
    Image(ImageFile),
    Failed(ConnectionError),
}

#[derive(Debug, Default)]
struct DownloaderState {
    seen: BTreeSet<u32>,
    assembler: BlockAssembler,
}

#[derive(Debug)]
struct DownloaderInner {
    source: BlockSource,
    directory: PathBuf,
    permits: Semaphore,
    state: Mutex<DownloaderState>,
    output: mpsc::UnboundedSender<DownloaderOutput>,
}

/// Fetches ready blocks concurrently and writes each complete image once.
#[derive(Debug)]
pub(crate) struct BlockDownloader {
    inner: Arc<DownloaderInner>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl BlockDownloader {
    pub(crate) fn new(
        source: BlockSource,
        directory: PathBuf,
        concurrency: usize,
        output: mpsc::UnboundedSender<DownloaderOutput>,
    ) -> Self {
        Self {
            inner: Arc::new(DownloaderInner {
                source,
                directory,
                permits: Semaphore::new(concurrency.max(1)),
                state: Mutex::new(DownloaderState::default()),
                output,
            }),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts downloads for block numbers not seen before in this capture.
    pub(crate) async fn enqueue_blocks(&self, numbers: &[u32]) {
        let fresh: Vec<u32> = {
            let mut state = self.inner.state.lock().await;
            let fresh: Vec<u32> = numbers
                .iter()
                .copied()
                .filter(|number| state.seen.insert(*number))
                .collect();
            for number in &fresh {
                state.assembler.expect(*number);
            }
            fresh
        };
        if fresh.is_empty() {
            return;
        }
        debug!(blocks = ?fresh, "queueing block downloads");

        for number in fresh {
            let inner = Arc::clone(&self.inner);
            let cancel = self.cancel.clone();
            self.tracker.spawn(
                async move {
                    tokio::select! {
                        () = cancel.cancelled() => debug!("block download cancelled"),
                        () = inner.run_block(number) => {}
                    }
                }
                .instrument(info_span!("block_download", block = number)),
            );
        }
    }

    /// Stops outstanding downloads and deletes every part file still held.
    pub(crate) async fn purge(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let state = self.inner.state.lock().await;
        for number in &state.seen {
            let path = part_path(&self.inner.directory, *number);
            if let Err(error) = tokio::fs::remove_file(&path).await
                && error.kind() != std::io::ErrorKind::NotFound
            {
                warn!(%error, path = %path.display(), "failed to remove block part file");
            }
        }
    }
}

impl DownloaderInner {
    async fn run_block(&self, number: u32) {
        let Ok(_permit) = self.permits.acquire().await else {
            return;
        };

        let block = match self.download(number).await {
            Ok(block) => block,
            Err(error) => {
                warn!(%error, "block download failed");
                self.emit(DownloaderOutput::Failed(ConnectionError::BlockDownload {
                    block: number,
                    source: Box::new(error),
                }));
                return;
            }
        };

        // Held across the writes so images leave in block order.
        let mut state = self.state.lock().await;
        for image in state.assembler.insert(block) {
            match self.write_image(&image).await {
                Ok(file) => self.emit(DownloaderOutput::Image(file)),
                Err(error) => self.emit(DownloaderOutput::Failed(ConnectionError::BlockDownload {
                    block: image.first,
                    source: Box::new(error),
                })),
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn download(&self, number: u32) -> Result<DownloadedBlock, TwainError> {
        let source = &self.source;
        let params = json!({
            "sessionId": source.session_id,
            "imageBlockNum": number,
        });
        let envelope = CommandEnvelope::new(CommandMethod::ReadImageBlock, Some(params));

        let (metadata, payload) = if source.transport.is_cloud() {
            let reply = source
                .transport
                .post_command(&source.endpoint, &envelope, &source.privet_token, source.timeout)
                .await?;
            let results = command_results(envelope.method(), &reply)?;
            let block_id = match results.get("imageBlockId") {
                Some(Value::String(id)) => id.clone(),
                Some(Value::Number(id)) => id.to_string(),
                _ => {
                    return Err(DecodeError::MissingField {
                        field: "results.imageBlockId",
                    }
                    .into());
                }
            };
            let url = append_path(&source.scanner_url, &format!("blocks/{block_id}"));
            let payload = source
                .transport
                .get_bytes(&url, &source.privet_token, source.timeout)
                .await?;
            (BlockMetadata::from_results(&results)?, payload)
        } else {
            let response = source
                .transport
                .post_for_block(&source.endpoint, &envelope, &source.privet_token, source.timeout)
                .await?;
            let content_type = response.content_type.unwrap_or_default();
            let body = multipart::decode_block(&content_type, &response.body)?;
            let metadata = match body.metadata {
                Some(reply) => {
                    let results = command_results(envelope.method(), &reply)?;
                    BlockMetadata::from_results(&results)?
                }
                None => BlockMetadata::single_part(),
            };
            (metadata, body.payload)
        };

        let path = part_path(&self.directory, number);
        write_file(&self.directory, &path, &payload).await?;
        debug!(bytes = payload.len(), path = %path.display(), "stored block");
        Ok(DownloadedBlock {
            number,
            path,
            metadata,
        })
    }

    async fn write_image(&self, image: &AssembledImage) -> Result<ImageFile, TwainError> {
        let mut bytes = Vec::new();
        for part in &image.parts {
            let data = tokio::fs::read(part).await.map_err(|source| storage(part, source))?;
            bytes.extend_from_slice(&data);
        }

        let path = self
            .directory
            .join(format!("image-{}-{}.pdf", image.first, image.last));
        write_file(&self.directory, &path, &bytes).await?;
        for part in &image.parts {
            if let Err(error) = tokio::fs::remove_file(part).await {
                debug!(%error, path = %part.display(), "could not remove part file");
            }
        }

        info!(first = image.first, last = image.last, path = %path.display(), "image assembled");
        Ok(ImageFile {
            path,
            metadata: image.metadata.clone(),
            first: image.first,
            last: image.last,
        })
    }

    fn emit(&self, output: DownloaderOutput) {
        if self.output.send(output).is_err() {
            debug!("session stopped listening for downloads");
        }
    }
}

fn part_path(directory: &Path, number: u32) -> PathBuf {
    directory.join(format!("block-{number}.part"))
}

async fn write_file(directory: &Path, path: &Path, bytes: &[u8]) -> Result<(), TwainError> {
    tokio::fs::create_dir_all(directory)
        .await
        .map_err(|source| storage(directory, source))?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| storage(path, source))?;
    Ok(())
}

fn storage(path: &Path, source: std::io::Error) -> TwainError {
    TransportError::Storage {
        path: path.display().to_string(),
        source,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::transport::command::TransportMode;
    use crate::transport::fake_scanner::FakeScanner;

    async fn capturing_source(scanner: &Arc<FakeScanner>) -> Result<BlockSource, TwainError> {
        let transport = CommandTransport::new(scanner.clone(), TransportMode::Direct);
        let endpoint = scanner.endpoint_url()?;
        let token = scanner.privet_token().to_string();
        let timeout = Duration::from_secs(5);
        for method in [CommandMethod::CreateSession, CommandMethod::StartCapturing] {
            let envelope = CommandEnvelope::new(method, Some(json!({"sessionId": "fake-session-1"})));
            transport.post_command(&endpoint, &envelope, &token, timeout).await?;
        }
        Ok(BlockSource {
            transport,
            endpoint,
            scanner_url: scanner.direct_url()?,
            privet_token: token,
            session_id: "fake-session-1".to_string(),
            timeout,
        })
    }

    #[tokio::test]
    async fn blocks_assemble_into_one_image_file() -> Result<(), TwainError> {
        let dir = tempfile::tempdir().map_err(|source| storage(Path::new("tmp"), source))?;
        let scanner = Arc::new(FakeScanner::builder().parts_per_image(2).build());
        let (sender, mut outputs) = mpsc::unbounded_channel();
        let downloader = BlockDownloader::new(
            capturing_source(&scanner).await?,
            dir.path().to_path_buf(),
            2,
            sender,
        );

        downloader.enqueue_blocks(&[2, 1]).await;
        downloader.enqueue_blocks(&[1, 2]).await;

        let image = assert_matches!(outputs.recv().await, Some(DownloaderOutput::Image(image)) => image);
        assert_eq!((1, 2), (image.first, image.last));
        assert_eq!(
            scanner.expected_image(1),
            tokio::fs::read(&image.path)
                .await
                .map_err(|source| storage(&image.path, source))?
        );
        assert!(!part_path(dir.path(), 1).exists());
        downloader.purge().await;
        assert_matches!(outputs.try_recv(), Err(_));
        Ok(())
    }

    #[tokio::test]
    async fn failed_reads_surface_as_connection_errors() -> Result<(), TwainError> {
        let dir = tempfile::tempdir().map_err(|source| storage(Path::new("tmp"), source))?;
        let scanner = Arc::new(FakeScanner::builder().fail_block_reads(true).build());
        let (sender, mut outputs) = mpsc::unbounded_channel();
        let downloader = BlockDownloader::new(
            capturing_source(&scanner).await?,
            dir.path().to_path_buf(),
            1,
            sender,
        );

        downloader.enqueue_blocks(&[1]).await;

        assert_matches!(
            outputs.recv().await,
            Some(DownloaderOutput::Failed(ConnectionError::BlockDownload { block: 1, .. }))
        );
        Ok(())
    }
}
