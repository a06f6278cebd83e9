use std::sync::Weak;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::SessionInner;
use crate::error::ConnectionError;
use crate::notification::SessionEvent;

/// Settings for the `waitForEvents` long-poll loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollSettings {
    pub(crate) interval: Duration,
    pub(crate) retries: u32,
}

/// Polls for session events until stopped.
///
/// Timeouts are expected and leave the failure counter alone. Any other
/// failure counts; a successful poll resets the counter. Once `retries`
/// consecutive failures pile up, one connection error is emitted and the
/// loop ends.
#[instrument(skip_all, level = "info", name = "event_loop")]
pub(crate) async fn run(session: Weak<SessionInner>, stop: CancellationToken, settings: PollSettings) {
    info!("starting event listener");
    let mut failures = 0u32;

    loop {
        if stop.is_cancelled() {
            break;
        }
        let Some(inner) = session.upgrade() else {
            debug!("session dropped, stopping event listener");
            break;
        };
        if inner.is_stopping() {
            break;
        }

        let result = tokio::select! {
            () = stop.cancelled() => break,
            result = inner.wait_for_events() => result,
        };
        match result {
            Ok(()) => failures = 0,
            Err(error) if error.is_timeout() => debug!("waitForEvents timed out, polling again"),
            Err(error) => {
                failures += 1;
                warn!(%error, failures, "waitForEvents failed");
                if failures >= settings.retries {
                    inner.emit(SessionEvent::ConnectionError(
                        ConnectionError::PollRetriesExhausted { attempts: failures },
                    ));
                    break;
                }
            }
        }
        drop(inner);

        tokio::select! {
            () = stop.cancelled() => break,
            () = sleep(settings.interval) => {}
        }
    }

    info!("event listener stopped");
}
