use serde_json::Value;
use thiserror::Error;

use crate::protocol::SessionState;

/// Errors returned by TWAIN Direct session, transport and download operations.
#[derive(Debug, Error)]
pub enum TwainError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("timed out after {timeout_ms}ms waiting for `{operation}`")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl TwainError {
    /// Returns whether this error is an expected deadline expiry.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub(crate) fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Network or HTTP-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request to `{url}` failed")]
    Request {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("HTTP request to `{url}` returned status {status}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("failed to access block storage at `{path}`")]
    Storage {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Malformed or unrecognised payloads.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("response body is not valid JSON")]
    Json(#[from] serde_json::Error),
    #[error("response body is a JSON {kind}, expected an object or array")]
    UnexpectedShape { kind: &'static str },
    #[error("response is missing required field `{field}`")]
    MissingField { field: &'static str },
    #[error("unrecognised scanner status `{value}`")]
    UnknownStatusDetected { value: String },
    #[error("unrecognised image part marker `{value}`")]
    UnknownMoreParts { value: String },
    #[error("malformed multipart block body: {reason}")]
    Multipart { reason: &'static str },
    #[error("invalid URL")]
    Url(#[from] url::ParseError),
    #[error("pub/sub message body is not a string")]
    EnvelopeBody,
}

/// Protocol-level session failures.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("`{method}` was rejected by the scanner: {results}")]
    CommandFailed { method: String, results: Value },
    #[error("`{method}` left the session in state `{actual}`, expected {expected}")]
    UnexpectedState {
        method: String,
        expected: &'static str,
        actual: SessionState,
    },
    #[error("unrecognised session state `{value}`")]
    UnknownState { value: String },
    #[error("operation requires state `noSession`, session is `{state}`")]
    InvalidState { state: SessionState },
    #[error("device info response is missing `x-privet-token`")]
    MissingPrivetToken,
    #[error("device info response does not list a command endpoint")]
    MissingEndpoint,
    #[error("session has not been opened")]
    NotOpen,
    #[error("cloud service rejected the request: {message}")]
    CloudRejected { message: String },
}

/// Asynchronous connection failures, delivered to the session listener.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("event broker connection lost: {reason}")]
    BrokerDisconnected { reason: String },
    #[error("waitForEvents failed {attempts} consecutive times")]
    PollRetriesExhausted { attempts: u32 },
    #[error("failed to download image block {block}")]
    BlockDownload {
        block: u32,
        #[source]
        source: Box<TwainError>,
    },
    #[error("the session command worker has stopped")]
    WorkerStopped,
}

/// Errors returned when validating CLI options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("`--url` is required unless `--fake` is set")]
    MissingScannerUrl,
    #[error("`--api-root` and `--token` are required unless `--fake` is set")]
    MissingCloudCredentials,
    #[error("failed to read task document `{path}`")]
    TaskIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("task document `{path}` is not valid JSON")]
    TaskJson {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn timeout_reports_operation_and_duration() {
        let error = TwainError::timeout("waitForEvents", Duration::from_secs(30));

        assert!(error.is_timeout());
        assert_eq!(
            "timed out after 30000ms waiting for `waitForEvents`",
            error.to_string()
        );
    }

    #[test]
    fn session_errors_fold_into_twain_error() {
        let error: TwainError = SessionError::MissingPrivetToken.into();

        assert!(!error.is_timeout());
        assert_eq!(
            "device info response is missing `x-privet-token`",
            error.to_string()
        );
    }
}
