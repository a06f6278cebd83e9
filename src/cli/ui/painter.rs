use owo_colors::{OwoColorize, Style};

use crate::protocol::{SessionState, StatusDetected};

/// How a piece of scanner output should stand out.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum Tone {
    Heading,
    Good,
    Attention,
    Quiet,
    Emphasis,
}

impl Tone {
    fn style(self) -> Style {
        match self {
            Self::Heading => Style::new().bold().cyan(),
            Self::Good => Style::new().bold().green(),
            Self::Attention => Style::new().bold().yellow(),
            Self::Quiet => Style::new().dimmed(),
            Self::Emphasis => Style::new().bold(),
        }
    }

    /// Capture activity reads as good, a closed session needs attention and
    /// an absent session fades out.
    pub(crate) fn for_state(state: SessionState) -> Self {
        match state {
            SessionState::Capturing | SessionState::Draining => Self::Good,
            SessionState::Closed => Self::Attention,
            SessionState::NoSession => Self::Quiet,
            SessionState::Ready => Self::Emphasis,
        }
    }

    pub(crate) fn for_detected(detected: Option<StatusDetected>) -> Self {
        match detected {
            None => Self::Quiet,
            Some(StatusDetected::Nominal) => Self::Good,
            Some(_) => Self::Attention,
        }
    }
}

/// Styles terminal output, or passes it through when colour is off.
#[derive(Debug)]
pub(crate) struct Painter {
    use_colour: bool,
}

impl Painter {
    pub(crate) fn new(use_colour: bool) -> Self {
        Self { use_colour }
    }

    pub(crate) fn heading<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text, Tone::Heading)
    }

    pub(crate) fn success<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text, Tone::Good)
    }

    pub(crate) fn warning<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text, Tone::Attention)
    }

    pub(crate) fn muted<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text, Tone::Quiet)
    }

    pub(crate) fn value<T: AsRef<str>>(&self, text: T) -> String {
        self.paint(text, Tone::Emphasis)
    }

    /// Session state name in its state-specific tone.
    pub(crate) fn state(&self, state: SessionState) -> String {
        self.paint(state.to_string(), Tone::for_state(state))
    }

    /// `status.detected` value, or `-` when the scanner reported none.
    pub(crate) fn detected(&self, detected: Option<StatusDetected>) -> String {
        let text = detected.map_or_else(|| "-".to_string(), |detected| detected.to_string());
        self.paint(text, Tone::for_detected(detected))
    }

    fn paint<T: AsRef<str>>(&self, text: T, tone: Tone) -> String {
        let text = text.as_ref();
        if self.use_colour {
            text.style(tone.style()).to_string()
        } else {
            text.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::capturing(SessionState::Capturing, Tone::Good)]
    #[case::draining(SessionState::Draining, Tone::Good)]
    #[case::closed(SessionState::Closed, Tone::Attention)]
    #[case::no_session(SessionState::NoSession, Tone::Quiet)]
    #[case::ready(SessionState::Ready, Tone::Emphasis)]
    fn states_map_to_tones(#[case] state: SessionState, #[case] expected: Tone) {
        assert_eq!(expected, Tone::for_state(state));
    }

    #[rstest]
    #[case::unreported(None, Tone::Quiet)]
    #[case::nominal(Some(StatusDetected::Nominal), Tone::Good)]
    #[case::jam(Some(StatusDetected::PaperJam), Tone::Attention)]
    #[case::cover(Some(StatusDetected::CoverOpen), Tone::Attention)]
    fn detected_conditions_map_to_tones(
        #[case] detected: Option<StatusDetected>,
        #[case] expected: Tone,
    ) {
        assert_eq!(expected, Tone::for_detected(detected));
    }

    #[test]
    fn plain_painter_prints_protocol_names() {
        let painter = Painter::new(false);

        assert_eq!("noSession", painter.state(SessionState::NoSession));
        assert_eq!("paperJam", painter.detected(Some(StatusDetected::PaperJam)));
        assert_eq!("-", painter.detected(None));
    }

    #[test]
    fn colour_painter_wraps_text_in_escapes() {
        let painter = Painter::new(true);

        let styled = painter.state(SessionState::Draining);

        assert_ne!("draining", styled);
        assert!(styled.contains("draining"));
    }
}
