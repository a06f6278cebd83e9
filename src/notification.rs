use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, instrument};

use crate::error::ConnectionError;
use crate::protocol::{BlockMetadata, SessionState, StatusDetected};

/// An assembled image written to the download directory.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedImage {
    pub path: PathBuf,
    /// Metadata of the image's first block.
    pub metadata: BlockMetadata,
    pub first_block: u32,
    pub last_block: u32,
}

/// Asynchronous notifications emitted by a session.
#[derive(Debug)]
pub enum SessionEvent {
    /// The scanner-reported session state changed.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// `status.success` or `status.detected` changed.
    StatusChanged {
        success: bool,
        detected: Option<StatusDetected>,
    },
    /// A complete image was assembled.
    ImageReceived(ReceivedImage),
    /// Capture finished and every block was released.
    DoneCapturing,
    /// A background activity failed.
    ConnectionError(ConnectionError),
}

/// Stream of [`SessionEvent`]s for one session.
#[derive(Debug)]
pub struct SessionEvents {
    inner: UnboundedReceiverStream<SessionEvent>,
}

impl SessionEvents {
    pub(crate) fn channel() -> (EventSink, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            EventSink { sender },
            Self {
                inner: UnboundedReceiverStream::new(receiver),
            },
        )
    }
}

impl Stream for SessionEvents {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Sending half held by the session and its background tasks.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    sender: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    #[instrument(skip(self), level = "trace")]
    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Err(error) = self.sender.send(event) {
            debug!(event = ?error.0, "session events receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use tokio_stream::StreamExt;

    use super::*;

    #[tokio::test]
    async fn sink_feeds_stream_in_order() {
        let (sink, mut events) = SessionEvents::channel();

        sink.emit(SessionEvent::StateChanged {
            from: SessionState::NoSession,
            to: SessionState::Ready,
        });
        sink.emit(SessionEvent::DoneCapturing);
        drop(sink);

        assert_matches!(
            events.next().await,
            Some(SessionEvent::StateChanged { to: SessionState::Ready, .. })
        );
        assert_matches!(events.next().await, Some(SessionEvent::DoneCapturing));
        assert_matches!(events.next().await, None);
    }

    #[test]
    fn emit_after_receiver_drop_is_silent() {
        let (sink, events) = SessionEvents::channel();
        drop(events);

        sink.emit(SessionEvent::DoneCapturing);
    }
}
