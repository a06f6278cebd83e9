use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, instrument};
use url::Url;

use super::broker::EventBroker;
use super::pubsub::PubSubClient;
use crate::error::{DecodeError, SessionError, TwainError};
use crate::notification::SessionEvents;
use crate::protocol::{ARRAY_KEY, AUTHORIZATION_HEADER, EventBrokerInfo, normalise_json_body};
use crate::session::{Session, SessionConfig};
use crate::transport::command::{CommandTransport, TransportMode, send_checked};
use crate::transport::http::{HttpClient, HttpMethod, HttpRequest};
use crate::uri::append_path;

const DEFAULT_API_TIMEOUT: Duration = Duration::from_secs(30);

/// A scanner registered with the cloud service.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CloudScannerInfo {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Root URL for requests relayed to this scanner.
    pub url: Url,
}

#[derive(Debug, Deserialize)]
struct ScannerRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
}

/// Client for a TWAIN Cloud API root.
#[derive(Debug, Clone)]
pub struct CloudConnection {
    api_root: Url,
    auth_token: String,
    http: Arc<dyn HttpClient>,
    timeout: Duration,
}

impl CloudConnection {
    #[must_use]
    pub fn new(api_root: Url, auth_token: impl Into<String>, http: Arc<dyn HttpClient>) -> Self {
        Self {
            api_root,
            auth_token: auth_token.into(),
            http,
            timeout: DEFAULT_API_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn api_root(&self) -> &Url {
        &self.api_root
    }

    /// URL that relays requests to the scanner with the given cloud id.
    #[must_use]
    pub fn scanner_url(&self, scanner_id: &str) -> Url {
        append_path(&self.api_root, &format!("scanners/{scanner_id}"))
    }

    /// Fetches the event broker descriptor for this account.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::CloudRejected`] when the service answers with
    /// a `message` instead of an `eventBroker`.
    #[instrument(skip(self), level = "info", fields(api_root = %self.api_root))]
    pub async fn event_broker_info(&self) -> Result<EventBrokerInfo, TwainError> {
        let reply = self.get("user").await?;
        if let Some(broker) = reply.get("eventBroker") {
            let info = EventBrokerInfo::deserialize(broker).map_err(DecodeError::from)?;
            debug!(topic = %info.topic, url = %info.url, "event broker descriptor");
            return Ok(info);
        }
        let message = reply
            .get("message")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingField { field: "eventBroker" })?;
        Err(SessionError::CloudRejected {
            message: message.to_string(),
        }
        .into())
    }

    /// Lists the scanners registered to this account.
    #[instrument(skip(self), level = "info", fields(api_root = %self.api_root))]
    pub async fn scanners(&self) -> Result<Vec<CloudScannerInfo>, TwainError> {
        let reply = self.get("scanners").await?;
        let records = reply
            .get(ARRAY_KEY)
            .cloned()
            .ok_or(DecodeError::UnexpectedShape { kind: "object" })?;
        let records: Vec<ScannerRecord> =
            serde_json::from_value(records).map_err(DecodeError::from)?;
        Ok(records
            .into_iter()
            .map(|record| CloudScannerInfo {
                url: self.scanner_url(&record.id),
                id: record.id,
                name: record.name,
                description: record.description,
            })
            .collect())
    }

    /// Fetches the broker descriptor and subscribes to its response topic.
    pub async fn connect(&self, pubsub: &dyn PubSubClient) -> Result<Arc<EventBroker>, TwainError> {
        let info = self.event_broker_info().await?;
        let broker = EventBroker::connect(info, &self.auth_token, pubsub).await?;
        info!("cloud connection ready");
        Ok(broker)
    }

    /// Creates a cloud-mode session whose replies arrive through `broker`.
    #[must_use]
    pub fn open_session(&self, config: SessionConfig, broker: Arc<EventBroker>) -> (Session, SessionEvents) {
        let transport = CommandTransport::new(
            Arc::clone(&self.http),
            TransportMode::Cloud {
                broker,
                authorization: self.auth_token.clone(),
            },
        );
        Session::with_transport(config, transport)
    }

    async fn get(&self, path: &str) -> Result<Value, TwainError> {
        let url = append_path(&self.api_root, path);
        let request = HttpRequest::json(HttpMethod::Get, url, self.timeout)
            .with_header(AUTHORIZATION_HEADER, self.auth_token.clone());
        let response = send_checked(self.http.as_ref(), request, false).await?;
        Ok(normalise_json_body(&response.body)?)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use std::sync::Mutex;

    use super::*;
    use crate::error::TransportError;
    use crate::protocol::JSON_CONTENT_TYPE;
    use crate::transport::http::{HttpError, HttpResponse};

    #[derive(Debug)]
    struct Rejecting;

    #[async_trait]
    impl HttpClient for Rejecting {
        async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, HttpError> {
            Ok(HttpResponse::new(200, r#"{"message":"token expired"}"#))
        }
    }

    #[tokio::test]
    async fn message_reply_is_a_cloud_rejection() {
        let connection = CloudConnection::new(
            Url::parse("https://cloud.example/api").expect("url"),
            "token",
            Arc::new(Rejecting),
        );

        let result = connection.event_broker_info().await;

        assert_matches!(
            result,
            Err(TwainError::Session(SessionError::CloudRejected { message })) if message == "token expired"
        );
    }

    #[test]
    fn scanner_url_appends_id() {
        let connection = CloudConnection::new(
            Url::parse("https://cloud.example/api/").expect("url"),
            "token",
            Arc::new(Rejecting),
        );

        assert_eq!(
            "https://cloud.example/api/scanners/abc",
            connection.scanner_url("abc").as_str()
        );
    }

    #[derive(Debug, Default)]
    struct Unavailable {
        seen: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpClient for Unavailable {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
            self.seen.lock().expect("lock").push(request);
            Ok(HttpResponse::new(503, "maintenance"))
        }
    }

    #[tokio::test]
    async fn api_requests_share_command_headers_and_status_errors() {
        let http = Arc::new(Unavailable::default());
        let connection = CloudConnection::new(
            Url::parse("https://cloud.example/api/").expect("url"),
            "token",
            http.clone(),
        );

        let result = connection.scanners().await;

        assert_matches!(
            result,
            Err(TwainError::Transport(TransportError::Status { status: 503, body, .. })) if body == "maintenance"
        );
        let seen = http.seen.lock().expect("lock");
        assert_eq!(Some(JSON_CONTENT_TYPE), seen[0].header("content-type"));
        assert_eq!(Some("token"), seen[0].header("authorization"));
        assert_eq!(None, seen[0].header("x-privet-token"));
    }
}
