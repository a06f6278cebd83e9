//! Session state machine: command sequencing, event polling and image release.

mod config;
mod event_loop;
mod tracker;
mod worker;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, instrument, warn};
use url::Url;

pub use config::{SessionConfig, default_download_dir};

use self::event_loop::PollSettings;
use self::tracker::SessionTracker;
use self::worker::CommandWorker;
use crate::blocks::downloader::{BlockDownloader, BlockSource, DownloaderOutput};
use crate::error::{ConnectionError, DecodeError, SessionError, TwainError};
use crate::notification::{EventSink, ReceivedImage, SessionEvent, SessionEvents};
use crate::protocol::{
    CommandEnvelope, CommandMethod, DeviceInfo, INFOEX_PATH, SessionObject, SessionState,
    StatusDetected, command_results, results_session,
};
use crate::transport::command::{CommandTransport, TransportMode};
use crate::transport::http::HttpClient;
use crate::uri::append_path;

/// Last block number used when every block must be released.
const LAST_BLOCK: u32 = i32::MAX.unsigned_abs();

/// A connection to one scanner.
///
/// Notifications arrive on the [`SessionEvents`] stream returned alongside
/// the session. Dropping the session stops its background tasks.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
pub(crate) struct SessionInner {
    config: SessionConfig,
    transport: CommandTransport,
    events: EventSink,
    shared: Mutex<SessionShared>,
}

#[derive(Debug, Default)]
struct SessionShared {
    tracker: SessionTracker,
    privet_token: Option<String>,
    endpoint: Option<Url>,
    paused: bool,
    stopping: bool,
    done_emitted: bool,
    worker: Option<CommandWorker>,
    downloader: Option<Arc<BlockDownloader>>,
    followups: Option<FollowupSenders>,
    shutdown: CancellationToken,
    stop_polling: CancellationToken,
}

#[derive(Debug, Clone)]
struct FollowupSenders {
    downloads: mpsc::UnboundedSender<DownloaderOutput>,
    release_all: mpsc::UnboundedSender<()>,
}

struct FollowupReceivers {
    downloads: mpsc::UnboundedReceiver<DownloaderOutput>,
    release_all: mpsc::UnboundedReceiver<()>,
}

impl Session {
    /// Creates a direct-mode session talking plain HTTP to the scanner.
    #[must_use]
    pub fn new(config: SessionConfig, http: Arc<dyn HttpClient>) -> (Self, SessionEvents) {
        Self::with_transport(config, CommandTransport::new(http, TransportMode::Direct))
    }

    /// Creates a session over an explicit transport.
    #[must_use]
    pub fn with_transport(config: SessionConfig, transport: CommandTransport) -> (Self, SessionEvents) {
        let (events, stream) = SessionEvents::channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                config,
                transport,
                events,
                shared: Mutex::new(SessionShared::default()),
            }),
        };
        (session, stream)
    }

    /// Starts a scanner session and the event listener.
    ///
    /// # Errors
    ///
    /// Fails with [`SessionError::InvalidState`] unless the session is in
    /// `noSession`, and with the underlying error when discovery or
    /// `createSession` fail.
    #[instrument(skip(self), level = "info", fields(scanner = %self.inner.config.scanner_url()))]
    pub async fn open(&self) -> Result<(), TwainError> {
        let inner = &self.inner;
        let previous_downloader = {
            let mut shared = inner.lock();
            let state = shared.tracker.state();
            if state != SessionState::NoSession {
                return Err(SessionError::InvalidState { state }.into());
            }
            shared.shutdown.cancel();
            shared.tracker = SessionTracker::default();
            shared.paused = false;
            shared.stopping = false;
            shared.done_emitted = false;
            shared.followups = None;
            shared.shutdown = CancellationToken::new();
            shared.stop_polling = shared.shutdown.child_token();
            shared.worker = Some(CommandWorker::spawn(
                inner.transport.clone(),
                inner.config.command_queue_depth(),
            ));
            shared.downloader.take()
        };
        if let Some(downloader) = previous_downloader {
            downloader.purge().await;
        }

        inner.resolve_endpoint().await?;

        let results = inner.command(CommandMethod::CreateSession, None).await?;
        inner.apply_results(&results).await?;
        let state = self.state();
        if state != SessionState::Ready {
            return Err(SessionError::UnexpectedState {
                method: CommandMethod::CreateSession.to_string(),
                expected: "ready",
                actual: state,
            }
            .into());
        }

        inner.start_background_tasks();
        info!(session_id = ?self.session_id(), "session opened");
        Ok(())
    }

    /// Sends a task document and returns the task the scanner accepted.
    ///
    /// # Errors
    ///
    /// Fails when the command fails or the reply carries no `session.task`.
    #[instrument(skip(self, task), level = "info")]
    pub async fn send_task(&self, task: Value) -> Result<Value, TwainError> {
        let params = json!({
            "sessionId": self.inner.require_session_id()?,
            "task": task,
        });
        let results = self
            .inner
            .command(CommandMethod::SendTask, Some(params))
            .await?;
        let session = self.inner.apply_results(&results).await?;
        session
            .task
            .ok_or_else(|| DecodeError::MissingField { field: "results.session.task" }.into())
    }

    /// Starts capturing with a fresh block downloader.
    ///
    /// # Errors
    ///
    /// Fails when the session is not open or `startCapturing` fails.
    #[instrument(skip(self), level = "info")]
    pub async fn start_capturing(&self) -> Result<(), TwainError> {
        let inner = &self.inner;
        let session_id = inner.require_session_id()?;
        let previous = {
            let mut shared = inner.lock();
            let (Some(endpoint), Some(followups)) = (shared.endpoint.clone(), shared.followups.clone())
            else {
                return Err(SessionError::NotOpen.into());
            };
            let source = BlockSource {
                transport: inner.transport.clone(),
                endpoint,
                scanner_url: inner.config.scanner_url().clone(),
                privet_token: shared.privet_token.clone().unwrap_or_default(),
                session_id: session_id.clone(),
                timeout: inner.config.command_timeout(),
            };
            let downloader = BlockDownloader::new(
                source,
                inner.config.download_dir().clone(),
                inner.config.block_concurrency(),
                followups.downloads,
            );
            shared.paused = false;
            shared.downloader.replace(Arc::new(downloader))
        };
        if let Some(previous) = previous {
            previous.purge().await;
        }

        let results = inner
            .command(
                CommandMethod::StartCapturing,
                Some(json!({"sessionId": session_id})),
            )
            .await?;
        inner.apply_results(&results).await?;
        Ok(())
    }

    /// Asks the scanner to stop capturing. Capturing can resume afterwards.
    ///
    /// # Errors
    ///
    /// Fails when the session is not open or `stopCapturing` fails.
    #[instrument(skip(self), level = "info")]
    pub async fn stop(&self) -> Result<(), TwainError> {
        let session_id = self.inner.require_session_id()?;
        self.inner.lock().paused = true;
        let results = self
            .inner
            .command(
                CommandMethod::StopCapturing,
                Some(json!({"sessionId": session_id})),
            )
            .await?;
        self.inner.apply_results(&results).await?;
        Ok(())
    }

    /// Closes the session.
    ///
    /// Blocks still held by the scanner are released once it reports
    /// `closed`.
    ///
    /// # Errors
    ///
    /// Fails when `closeSession` fails or leaves the session in a state
    /// other than `closed` or `noSession`.
    pub async fn close(&self) -> Result<(), TwainError> {
        self.inner.close().await
    }

    /// Acknowledges blocks `from..=to` so the scanner can discard them.
    ///
    /// # Errors
    ///
    /// Fails when the session is not open or `releaseImageBlocks` fails.
    pub async fn release_image_blocks(&self, from: u32, to: u32) -> Result<(), TwainError> {
        self.inner.release_image_blocks(from, to).await
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.lock().tracker.state()
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.inner.lock().tracker.revision()
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.inner.lock().tracker.session_id().map(str::to_string)
    }

    /// Last reported `status.success` and `status.detected`.
    #[must_use]
    pub fn status(&self) -> (bool, Option<StatusDetected>) {
        self.inner.lock().tracker.status()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.is_stopping()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.inner.lock().shutdown.cancel();
    }
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        self.events.emit(event);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    fn require_session_id(&self) -> Result<String, TwainError> {
        self.lock()
            .tracker
            .session_id()
            .map(str::to_string)
            .ok_or_else(|| SessionError::NotOpen.into())
    }

    /// Fetches device info unless a privet token is already cached.
    async fn resolve_endpoint(&self) -> Result<(), TwainError> {
        if self.lock().privet_token.is_some() {
            return Ok(());
        }

        let scanner_url = self.config.scanner_url();
        let device =
            fetch_device_info(&self.transport, scanner_url, self.config.command_timeout()).await?;
        let endpoint = append_path(scanner_url, device.api_path());
        debug!(%endpoint, "resolved command endpoint");

        let mut shared = self.lock();
        shared.privet_token = Some(device.privet_token().to_string());
        shared.endpoint = Some(endpoint);
        Ok(())
    }

    /// Runs one command through the ordered worker and returns its `results`.
    async fn command(&self, method: CommandMethod, params: Option<Value>) -> Result<Value, TwainError> {
        let (worker, endpoint, privet_token) = {
            let shared = self.lock();
            let (Some(worker), Some(endpoint)) = (shared.worker.clone(), shared.endpoint.clone())
            else {
                return Err(SessionError::NotOpen.into());
            };
            (worker, endpoint, shared.privet_token.clone().unwrap_or_default())
        };
        let envelope = CommandEnvelope::new(method, params);
        let reply = worker
            .submit(endpoint, envelope, privet_token, self.config.command_timeout())
            .await?;
        command_results(&method.to_string(), &reply)
    }

    async fn apply_results(&self, results: &Value) -> Result<SessionObject, TwainError> {
        let session = results_session(results)?;
        self.handle_update(&session).await?;
        Ok(session)
    }

    /// Applies one session object from a reply or event and fans out what
    /// changed.
    ///
    /// State, status and done notifications are emitted under the shared
    /// lock so listeners see transitions in the order the tracker applied
    /// them.
    async fn handle_update(&self, session: &SessionObject) -> Result<(), TwainError> {
        let (ready_blocks, downloader, release_all, finished) = {
            let mut shared = self.lock();
            let outcome = shared.tracker.apply(session)?;
            if outcome.stale {
                return Ok(());
            }
            let finished = matches!(outcome.state_change, Some((_, SessionState::NoSession)));

            if let Some((from, to)) = outcome.state_change {
                info!(%from, %to, "session state changed");
                self.emit(SessionEvent::StateChanged { from, to });
            }
            if finished && !std::mem::replace(&mut shared.done_emitted, true) {
                self.emit(SessionEvent::DoneCapturing);
            }
            if let Some((success, detected)) = outcome.status_change {
                info!(success, ?detected, "session status changed");
                self.emit(SessionEvent::StatusChanged { success, detected });
            }

            let release_all = if outcome.entered_closed && shared.stopping {
                shared
                    .followups
                    .as_ref()
                    .map(|followups| followups.release_all.clone())
            } else {
                None
            };
            let downloader = if finished {
                shared.shutdown.cancel();
                shared.downloader.take()
            } else {
                shared.downloader.clone()
            };
            (outcome.ready_blocks, downloader, release_all, finished)
        };

        if let Some(downloader) = downloader {
            if finished {
                downloader.purge().await;
            } else if !ready_blocks.is_empty() {
                downloader.enqueue_blocks(&ready_blocks).await;
            }
        }

        if let Some(release_all) = release_all {
            info!("session closed while stopping, releasing every block");
            if release_all.send(()).is_err() {
                debug!("release task already stopped");
            }
        }
        Ok(())
    }

    #[instrument(skip(self), level = "info")]
    async fn close(&self) -> Result<(), TwainError> {
        let session_id = {
            let mut shared = self.lock();
            shared.stopping = true;
            shared.stop_polling.cancel();
            shared.tracker.session_id().map(str::to_string)
        };
        let session_id = session_id.ok_or(SessionError::NotOpen)?;

        let results = self
            .command(
                CommandMethod::CloseSession,
                Some(json!({"sessionId": session_id})),
            )
            .await?;
        self.apply_results(&results).await?;

        let state = self.lock().tracker.state();
        match state {
            SessionState::Closed | SessionState::NoSession => Ok(()),
            actual => Err(SessionError::UnexpectedState {
                method: CommandMethod::CloseSession.to_string(),
                expected: "closed or noSession",
                actual,
            }
            .into()),
        }
    }

    #[instrument(skip(self), level = "info")]
    async fn release_image_blocks(&self, from: u32, to: u32) -> Result<(), TwainError> {
        let params = json!({
            "sessionId": self.require_session_id()?,
            "imageBlockNum": from,
            "lastImageBlockNum": to,
        });
        let results = self
            .command(CommandMethod::ReleaseImageBlocks, Some(params))
            .await?;
        info!(from, to, "released image blocks");
        self.apply_results(&results).await?;

        let should_close = {
            let shared = self.lock();
            let tracker = &shared.tracker;
            tracker.done_capturing()
                && tracker.image_blocks_drained()
                && !shared.paused
                && !shared.stopping
                && tracker.state() != SessionState::NoSession
        };
        if should_close {
            info!("capture complete and drained, closing session");
            if let Err(error) = self.close().await {
                warn!(%error, "closing finished session failed");
                self.emit_done_once();
            }
        }
        Ok(())
    }

    fn emit_done_once(&self) {
        let mut shared = self.lock();
        if !std::mem::replace(&mut shared.done_emitted, true) {
            self.emit(SessionEvent::DoneCapturing);
        }
    }

    /// One `waitForEvents` round trip; applies every event it returns.
    #[instrument(skip(self), level = "debug")]
    pub(crate) async fn wait_for_events(&self) -> Result<(), TwainError> {
        let (endpoint, privet_token, session_id, revision) = {
            let shared = self.lock();
            let (Some(endpoint), Some(session_id)) = (
                shared.endpoint.clone(),
                shared.tracker.session_id().map(str::to_string),
            ) else {
                return Err(SessionError::NotOpen.into());
            };
            (
                endpoint,
                shared.privet_token.clone().unwrap_or_default(),
                session_id,
                shared.tracker.revision(),
            )
        };

        let envelope = CommandEnvelope::new(
            CommandMethod::WaitForEvents,
            Some(json!({"sessionId": session_id, "sessionRevision": revision})),
        );
        let reply = self
            .transport
            .post_command(&endpoint, &envelope, &privet_token, self.config.poll_timeout())
            .await?;
        let results = command_results(envelope.method(), &reply)?;
        let events = results
            .get("events")
            .and_then(Value::as_array)
            .ok_or(DecodeError::MissingField { field: "results.events" })?;

        for event in events {
            let session = event
                .get("session")
                .ok_or(DecodeError::MissingField { field: "events.session" })?;
            self.handle_update(&SessionObject::from_value(session)?)
                .await?;
        }
        Ok(())
    }

    /// Spawns the event loop, the release task and, in cloud mode, the
    /// broker watcher.
    fn start_background_tasks(self: &Arc<Self>) {
        let (downloads_tx, downloads) = mpsc::unbounded_channel();
        let (release_all_tx, release_all) = mpsc::unbounded_channel();
        let (shutdown, stop_polling) = {
            let mut shared = self.lock();
            shared.followups = Some(FollowupSenders {
                downloads: downloads_tx,
                release_all: release_all_tx,
            });
            (shared.shutdown.clone(), shared.stop_polling.clone())
        };

        let settings = PollSettings {
            interval: self.config.poll_interval(),
            retries: self.config.poll_retries(),
        };
        tokio::spawn(event_loop::run(Arc::downgrade(self), stop_polling, settings));

        let receivers = FollowupReceivers {
            downloads,
            release_all,
        };
        tokio::spawn(
            run_followups(Arc::downgrade(self), receivers, shutdown.clone())
                .instrument(info_span!("release_task")),
        );

        if let TransportMode::Cloud { broker, .. } = self.transport.mode() {
            let lost = broker.connection_lost();
            let broker = Arc::clone(broker);
            let events = self.events.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = shutdown.cancelled() => {}
                    () = lost.cancelled() => {
                        let reason = broker
                            .lost_reason()
                            .unwrap_or_else(|| "connection lost".to_string());
                        events.emit(SessionEvent::ConnectionError(
                            ConnectionError::BrokerDisconnected { reason },
                        ));
                    }
                }
            });
        }
    }
}

/// Fetches a scanner's `/privet/infoex` description without opening a
/// session.
///
/// # Errors
///
/// Fails when the request fails or the reply lacks a privet token or an
/// API path.
pub async fn discover_device(
    http: Arc<dyn HttpClient>,
    scanner_url: &Url,
    timeout: Duration,
) -> Result<DeviceInfo, TwainError> {
    let transport = CommandTransport::new(http, TransportMode::Direct);
    fetch_device_info(&transport, scanner_url, timeout).await
}

async fn fetch_device_info(
    transport: &CommandTransport,
    scanner_url: &Url,
    timeout: Duration,
) -> Result<DeviceInfo, TwainError> {
    let url = append_path(scanner_url, INFOEX_PATH);
    let reply = transport.get_json(&url, "", timeout).await?;
    Ok(DeviceInfo::from_value(&reply)?)
}

/// Reports assembled images and releases their blocks, in arrival order.
async fn run_followups(
    session: Weak<SessionInner>,
    mut receivers: FollowupReceivers,
    shutdown: CancellationToken,
) {
    loop {
        let followup = tokio::select! {
            () = shutdown.cancelled() => break,
            output = receivers.downloads.recv() => match output {
                Some(output) => Followup::Download(output),
                None => break,
            },
            request = receivers.release_all.recv() => match request {
                Some(()) => Followup::ReleaseAll,
                None => break,
            },
        };
        let Some(inner) = session.upgrade() else {
            break;
        };

        match followup {
            Followup::Download(DownloaderOutput::Image(image)) => {
                let (first, last) = (image.first, image.last);
                inner.emit(SessionEvent::ImageReceived(ReceivedImage {
                    path: image.path,
                    metadata: image.metadata,
                    first_block: first,
                    last_block: last,
                }));
                if let Err(error) = inner.release_image_blocks(first, last).await {
                    warn!(%error, first, last, "failed to release image blocks");
                }
            }
            Followup::Download(DownloaderOutput::Failed(error)) => {
                inner.emit(SessionEvent::ConnectionError(error));
            }
            Followup::ReleaseAll => {
                if let Err(error) = inner.release_image_blocks(1, LAST_BLOCK).await {
                    warn!(%error, "failed to release blocks after close");
                }
            }
        }
    }
    debug!("release task stopped");
}

enum Followup {
    Download(DownloaderOutput),
    ReleaseAll,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::transport::fake_scanner::FakeScanner;

    const UPDATES: u64 = 40;

    fn alternating_update(revision: u64) -> SessionObject {
        let state = if revision % 2 == 1 { "ready" } else { "capturing" };
        SessionObject::from_value(&json!({
            "sessionId": "s1",
            "revision": revision,
            "state": state,
        }))
        .expect("session object should decode")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_updates_notify_an_unbroken_state_chain() -> anyhow::Result<()> {
        for _trial in 0..50 {
            let scanner = Arc::new(FakeScanner::builder().build());
            let config = SessionConfig::builder()
                .scanner_url(scanner.direct_url()?)
                .build();
            let (session, events) = Session::new(config, scanner);

            let tasks: Vec<_> = (1..=UPDATES)
                .map(|revision| {
                    let inner = Arc::clone(&session.inner);
                    tokio::spawn(async move {
                        inner.handle_update(&alternating_update(revision)).await
                    })
                })
                .collect();
            for task in tasks {
                task.await??;
            }

            assert_eq!(UPDATES, session.revision());
            let final_state = session.state();
            drop(session);

            let mut current = SessionState::NoSession;
            let mut changes = 0;
            let events: Vec<SessionEvent> = events.collect().await;
            for event in events {
                if let SessionEvent::StateChanged { from, to } = event {
                    assert_eq!(current, from);
                    current = to;
                    changes += 1;
                }
            }
            assert_eq!(final_state, current);
            assert!(changes >= 1);
        }
        Ok(())
    }
}
