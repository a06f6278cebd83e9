use tracing::{debug, instrument};

use crate::error::TwainError;
use crate::protocol::{SessionObject, SessionState, StatusDetected};

/// What a session update changed.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub(crate) struct UpdateOutcome {
    /// The update was older than the last seen revision and was ignored.
    pub(crate) stale: bool,
    pub(crate) state_change: Option<(SessionState, SessionState)>,
    pub(crate) status_change: Option<(bool, Option<StatusDetected>)>,
    pub(crate) ready_blocks: Vec<u32>,
    /// The state moved to `closed` from another state.
    pub(crate) entered_closed: bool,
}

/// Server-reported session fields, updated only from session objects.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct SessionTracker {
    session_id: Option<String>,
    revision: u64,
    state: SessionState,
    status_success: bool,
    status_detected: Option<StatusDetected>,
    done_capturing: bool,
    image_blocks_drained: bool,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self {
            session_id: None,
            revision: 0,
            state: SessionState::NoSession,
            status_success: true,
            status_detected: None,
            done_capturing: false,
            image_blocks_drained: false,
        }
    }
}

impl SessionTracker {
    /// Applies one session object.
    ///
    /// The update is validated in full before any field changes, so a
    /// rejected update leaves the tracker untouched.
    #[instrument(skip(self, update), level = "debug", fields(revision = update.revision, state = %update.state))]
    pub(crate) fn apply(&mut self, update: &SessionObject) -> Result<UpdateOutcome, TwainError> {
        if update.revision < self.revision {
            debug!(current = self.revision, "ignoring stale session update");
            return Ok(UpdateOutcome {
                stale: true,
                ..UpdateOutcome::default()
            });
        }
        let new_state = update.parsed_state()?;
        let detected = update.parsed_detected()?;

        if self.session_id.is_none() {
            self.session_id.clone_from(&update.session_id);
        }
        self.revision = self.revision.max(update.revision);
        if let Some(done) = update.done_capturing {
            self.done_capturing = done;
        }
        if let Some(drained) = update.image_blocks_drained {
            self.image_blocks_drained = drained;
        }

        let mut outcome = UpdateOutcome {
            ready_blocks: update.image_blocks.clone(),
            ..UpdateOutcome::default()
        };
        let old_state = self.state;
        if new_state != old_state {
            self.state = new_state;
            outcome.state_change = Some((old_state, new_state));
            outcome.entered_closed = new_state == SessionState::Closed;
        }

        let mut success = self.status_success;
        let mut new_detected = self.status_detected;
        if let Some(status) = &update.status {
            if let Some(value) = status.success {
                success = value;
            }
            if detected.is_some() {
                new_detected = detected;
            }
        }
        if success != self.status_success || new_detected != self.status_detected {
            self.status_success = success;
            self.status_detected = new_detected;
            outcome.status_change = Some((success, new_detected));
        }

        Ok(outcome)
    }

    pub(crate) fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub(crate) fn revision(&self) -> u64 {
        self.revision
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn done_capturing(&self) -> bool {
        self.done_capturing
    }

    pub(crate) fn image_blocks_drained(&self) -> bool {
        self.image_blocks_drained
    }

    pub(crate) fn status(&self) -> (bool, Option<StatusDetected>) {
        (self.status_success, self.status_detected)
    }
}
