use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};
use url::Url;

use super::http::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse};
use crate::cloud::broker::EventBroker;
use crate::error::{TransportError, TwainError};
use crate::protocol::{
    AUTHORIZATION_HEADER, CONTENT_TYPE_HEADER, CommandEnvelope, PRIVET_TOKEN_HEADER,
    normalise_json_body,
};

/// How requests reach the scanner.
#[derive(Debug, Clone)]
pub enum TransportMode {
    /// Plain HTTP on the local network.
    Direct,
    /// HTTP through a cloud relay; replies arrive on the event broker.
    Cloud {
        broker: Arc<EventBroker>,
        authorization: String,
    },
}

/// Raw block body returned by a direct `readImageBlock`.
#[derive(Debug, Clone)]
pub struct BlockResponse {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Issues protocol requests over the selected transport.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    http: Arc<dyn HttpClient>,
    mode: TransportMode,
}

impl CommandTransport {
    #[must_use]
    pub fn new(http: Arc<dyn HttpClient>, mode: TransportMode) -> Self {
        Self { http, mode }
    }

    #[must_use]
    pub fn is_cloud(&self) -> bool {
        matches!(self.mode, TransportMode::Cloud { .. })
    }

    #[must_use]
    pub fn mode(&self) -> &TransportMode {
        &self.mode
    }

    /// Issues a GET and returns the decoded JSON reply.
    ///
    /// In cloud mode the reply is the next relayed message without a
    /// `commandId`.
    #[instrument(skip(self, privet_token), level = "debug", fields(%url, cloud = self.is_cloud()))]
    pub async fn get_json(
        &self,
        url: &Url,
        privet_token: &str,
        timeout: Duration,
    ) -> Result<Value, TwainError> {
        match &self.mode {
            TransportMode::Direct => {
                let response = self
                    .send(HttpMethod::Get, url, privet_token, None, timeout)
                    .await?;
                Ok(normalise_json_body(&response.body)?)
            }
            TransportMode::Cloud { broker, .. } => {
                let mut pending = broker.add_listener(None, false);
                self.send(HttpMethod::Get, url, privet_token, None, timeout)
                    .await?;
                let body = pending.next(timeout, url.path()).await?;
                debug!(%body, "relayed GET reply");
                Ok(normalise_json_body(body.as_bytes())?)
            }
        }
    }

    /// Posts a command envelope and returns the decoded JSON reply.
    #[instrument(
        skip(self, envelope, privet_token),
        level = "debug",
        fields(method = envelope.method(), command_id = %envelope.command_id(), cloud = self.is_cloud())
    )]
    pub async fn post_command(
        &self,
        url: &Url,
        envelope: &CommandEnvelope,
        privet_token: &str,
        timeout: Duration,
    ) -> Result<Value, TwainError> {
        let body = envelope.to_body()?;
        match &self.mode {
            TransportMode::Direct => {
                let response = self
                    .send(HttpMethod::Post, url, privet_token, Some(body), timeout)
                    .await?;
                debug!(body = %response.body_text(), "command reply");
                Ok(normalise_json_body(&response.body)?)
            }
            TransportMode::Cloud { broker, .. } => {
                let mut pending = broker.add_listener(Some(envelope.command_id()), false);
                self.send(HttpMethod::Post, url, privet_token, Some(body), timeout)
                    .await?;
                let reply = pending.next(timeout, envelope.method()).await?;
                debug!(body = %reply, "relayed command reply");
                Ok(normalise_json_body(reply.as_bytes())?)
            }
        }
    }

    /// Posts a command whose reply is a raw (multipart) block body.
    #[instrument(skip(self, envelope, privet_token), level = "debug", fields(command_id = %envelope.command_id()))]
    pub async fn post_for_block(
        &self,
        url: &Url,
        envelope: &CommandEnvelope,
        privet_token: &str,
        timeout: Duration,
    ) -> Result<BlockResponse, TwainError> {
        let body = envelope.to_body()?;
        let response = self
            .send(HttpMethod::Post, url, privet_token, Some(body), timeout)
            .await?;
        Ok(BlockResponse {
            content_type: response.header(CONTENT_TYPE_HEADER).map(str::to_string),
            body: response.body,
        })
    }

    /// Fetches raw bytes with a GET, bypassing the relay.
    #[instrument(skip(self, privet_token), level = "debug", fields(%url))]
    pub async fn get_bytes(
        &self,
        url: &Url,
        privet_token: &str,
        timeout: Duration,
    ) -> Result<Vec<u8>, TwainError> {
        let response = self
            .send(HttpMethod::Get, url, privet_token, None, timeout)
            .await?;
        Ok(response.body)
    }

    async fn send(
        &self,
        method: HttpMethod,
        url: &Url,
        privet_token: &str,
        body: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<HttpResponse, TwainError> {
        let mut request = HttpRequest::json(method, url.clone(), timeout)
            .with_header(PRIVET_TOKEN_HEADER, privet_token)
            .with_body(body);
        if let TransportMode::Cloud { authorization, .. } = &self.mode {
            request = request.with_header(AUTHORIZATION_HEADER, authorization.clone());
        }
        send_checked(self.http.as_ref(), request, self.is_cloud()).await
    }
}

/// Executes `request` and maps transport failures and rejected statuses.
///
/// The cloud relay acknowledges with exactly 200, so `relayed` requests
/// accept nothing else; other requests accept any 2xx.
pub(crate) async fn send_checked(
    http: &dyn HttpClient,
    request: HttpRequest,
    relayed: bool,
) -> Result<HttpResponse, TwainError> {
    let (method, url, timeout) = (request.method, request.url.clone(), request.timeout);
    let response = match http.execute(request).await {
        Ok(response) => response,
        Err(HttpError::Timeout) => {
            return Err(TwainError::timeout(format!("{method} {}", url.path()), timeout));
        }
        Err(HttpError::Request(source)) => {
            return Err(TransportError::Request {
                url: url.to_string(),
                source,
            }
            .into());
        }
    };

    let accepted = if relayed {
        response.status == 200
    } else {
        response.is_success()
    };
    if !accepted {
        warn!(status = response.status, %url, "request rejected");
        return Err(TransportError::Status {
            url: url.to_string(),
            status: response.status,
            body: response.body_text(),
        }
        .into());
    }
    Ok(response)
}
