use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::protocol::{CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE};

/// HTTP verbs used by the protocol.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::Display)]
pub enum HttpMethod {
    #[strum(to_string = "GET")]
    Get,
    #[strum(to_string = "POST")]
    Post,
}

/// One outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    /// Read deadline for the whole exchange.
    pub timeout: Duration,
}

impl HttpRequest {
    /// Starts a request carrying the protocol's JSON content type.
    #[must_use]
    pub fn json(method: HttpMethod, url: Url, timeout: Duration) -> Self {
        Self {
            method,
            url,
            headers: vec![(CONTENT_TYPE_HEADER.to_string(), JSON_CONTENT_TYPE.to_string())],
            body: None,
            timeout,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body;
        self
    }

    /// Looks up a request header by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// A minimal HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    /// Response headers with lowercase names.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with a status code and body.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Adds a header to the response.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    /// Looks up a response header by name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body rendered as lossy UTF-8 for diagnostics.
    #[must_use]
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _value)| key.eq_ignore_ascii_case(name))
        .map(|(_key, value)| value.as_str())
}

/// Errors returned by an [`HttpClient`].
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request timed out")]
    Timeout,
    #[error("request failed")]
    Request(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Submits one HTTP request and returns its response.
///
/// Implementations own connection pooling and TLS; the session only needs
/// "send this, give me the body or an error".
#[async_trait]
pub trait HttpClient: Send + Sync + fmt::Debug {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError>;
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a client with the given connect timeout.
    ///
    /// # Errors
    ///
    /// Fails when the TLS backend cannot be initialised.
    pub fn new(connect_timeout: Duration) -> Result<Self, HttpError> {
        let inner = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|error| HttpError::Request(Box::new(error)))?;
        Ok(Self { inner })
    }
}

impl Default for ReqwestHttpClient {
    /// Uses a 15 second connect timeout, or reqwest's defaults if that
    /// client cannot be built.
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT).unwrap_or_else(|error| {
            warn!(%error, connect_timeout = ?DEFAULT_CONNECT_TIMEOUT, "falling back to a default HTTP client");
            Self {
                inner: reqwest::Client::new(),
            }
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
            timeout,
        } = request;

        let mut builder = match method {
            HttpMethod::Get => self.inner.get(url),
            HttpMethod::Post => self.inner.post(url),
        };
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_reqwest_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout
    } else {
        HttpError::Request(Box::new(error))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn response_header_lookup_ignores_case() {
        let response = HttpResponse::new(200, Vec::new())
            .with_header("Content-Type", "multipart/mixed; boundary=x");

        assert_eq!(
            Some("multipart/mixed; boundary=x"),
            response.header("content-type")
        );
        assert_eq!(None, response.header("x-privet-token"));
    }

    #[test]
    fn json_request_starts_with_content_type() {
        let url = Url::parse("http://scanner.local/privet/infoex").expect("url");

        let request = HttpRequest::json(HttpMethod::Get, url, Duration::from_secs(1))
            .with_header("Authorization", "token");

        assert_eq!(Some(JSON_CONTENT_TYPE), request.header("content-type"));
        assert_eq!(Some("token"), request.header("authorization"));
        assert_eq!(None, request.body);
    }

    #[test]
    fn client_builds_with_requested_connect_timeout() {
        assert!(ReqwestHttpClient::new(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn success_covers_only_2xx() {
        assert!(HttpResponse::new(204, Vec::new()).is_success());
        assert!(!HttpResponse::new(404, Vec::new()).is_success());
    }
}
