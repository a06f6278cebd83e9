use std::fmt::{self, Display, Formatter};

use crate::notification::SessionEvent;

use super::painter::Painter;

/// Renders one session event as a single line.
pub(crate) struct SessionEventView<'a> {
    event: &'a SessionEvent,
    painter: &'a Painter,
}

impl<'a> SessionEventView<'a> {
    pub(crate) fn new(event: &'a SessionEvent, painter: &'a Painter) -> Self {
        Self { event, painter }
    }
}

impl Display for SessionEventView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let painter = self.painter;
        match self.event {
            SessionEvent::StateChanged { from, to } => write!(
                f,
                "{} {} -> {}",
                painter.heading("state"),
                painter.state(*from),
                painter.state(*to)
            ),
            SessionEvent::StatusChanged { success, detected } => {
                let success = if *success {
                    painter.success("ok")
                } else {
                    painter.warning("failed")
                };
                write!(f, "{} {success} {}", painter.heading("status"), painter.detected(*detected))
            }
            SessionEvent::ImageReceived(image) => write!(
                f,
                "{} {} {}",
                painter.success("image"),
                painter.value(image.path.display().to_string()),
                painter.muted(format!("(blocks {}-{})", image.first_block, image.last_block))
            ),
            SessionEvent::DoneCapturing => {
                write!(f, "{} capture complete", painter.success("done"))
            }
            SessionEvent::ConnectionError(error) => {
                write!(f, "{} {error}", painter.warning("error"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::error::ConnectionError;
    use crate::notification::ReceivedImage;
    use crate::protocol::{BlockMetadata, SessionState, StatusDetected};

    fn render(event: &SessionEvent) -> String {
        SessionEventView::new(event, &Painter::new(false)).to_string()
    }

    #[rstest]
    #[case::state(
        SessionEvent::StateChanged { from: SessionState::Ready, to: SessionState::Capturing },
        "state ready -> capturing"
    )]
    #[case::status(
        SessionEvent::StatusChanged { success: false, detected: Some(StatusDetected::PaperJam) },
        "status failed paperJam"
    )]
    #[case::done(SessionEvent::DoneCapturing, "done capture complete")]
    fn events_render_as_single_lines(#[case] event: SessionEvent, #[case] expected: &str) {
        assert_eq!(expected, render(&event));
    }

    #[test]
    fn image_line_names_the_file_and_blocks() {
        let event = SessionEvent::ImageReceived(ReceivedImage {
            path: PathBuf::from("/tmp/scans/image-1-2.pdf"),
            metadata: BlockMetadata::single_part(),
            first_block: 1,
            last_block: 2,
        });

        assert_snapshot!(render(&event), @"image /tmp/scans/image-1-2.pdf (blocks 1-2)");
    }

    #[test]
    fn connection_errors_render_their_message() {
        let event = SessionEvent::ConnectionError(ConnectionError::PollRetriesExhausted { attempts: 3 });

        assert!(render(&event).starts_with("error "));
    }
}
