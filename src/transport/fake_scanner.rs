use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bon::Builder;
use serde_json::{Value, json};
use tracing::{debug, instrument};
use url::Url;

use super::http::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse};
use crate::blocks::multipart;
use crate::cloud::pubsub::PubSubPublisher;
use crate::error::DecodeError;
use crate::protocol::{
    AUTHORIZATION_HEADER, CONTENT_TYPE_HEADER, INFOEX_PATH, JSON_CONTENT_TYPE, PRIVET_TOKEN_HEADER, PROTOCOL_KIND,
    SessionState,
};
use crate::uri::append_path;

/// Root URL of the simulated scanner in direct mode.
pub const FAKE_SCANNER_URL: &str = "http://fake-scanner.local:34034/";
/// API root of the simulated cloud service.
pub const FAKE_CLOUD_API_ROOT: &str = "https://fake-cloud.local/api/";
/// Cloud id of the simulated scanner.
pub const FAKE_CLOUD_SCANNER_ID: &str = "fake-scanner-1";

const API_PATH: &str = "/privet/twaindirect/session";
const BLOCK_BOUNDARY: &str = "twaindirect-fake-block";
const DEFAULT_PRIVET_TOKEN: &str = "fake-privet-token";

/// Where the simulated cloud relay publishes replies.
#[derive(Debug, Clone)]
pub struct FakeCloudRelay {
    pub publisher: PubSubPublisher,
    pub topic: String,
}

#[derive(Debug)]
struct FakeState {
    session_id: Option<String>,
    sessions_created: u32,
    revision: u64,
    state: SessionState,
    done_capturing: bool,
    captured: bool,
    ready: BTreeSet<u32>,
    task: Option<Value>,
    methods: Vec<String>,
    releases: Vec<(u64, u64)>,
    polls: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            session_id: None,
            sessions_created: 0,
            revision: 0,
            state: SessionState::NoSession,
            done_capturing: false,
            captured: false,
            ready: BTreeSet::new(),
            task: None,
            methods: Vec::new(),
            releases: Vec::new(),
            polls: 0,
        }
    }
}

/// Simulated TWAIN Direct scanner behind the [`HttpClient`] seam.
///
/// Every image is captured as soon as capturing starts. Each image is split
/// into `parts_per_image` blocks. With a cloud relay configured, scanner
/// replies are published on the relay topic instead of returned inline.
#[derive(Debug, Builder)]
pub struct FakeScanner {
    #[builder(default = 1)]
    images: u32,
    #[builder(default = 1)]
    parts_per_image: u32,
    #[builder(into, default = DEFAULT_PRIVET_TOKEN.to_string())]
    privet_token: String,
    /// Leading `waitForEvents` calls answered with HTTP 500.
    #[builder(default)]
    wait_for_events_failures: u32,
    /// Leading `waitForEvents` calls answered with a read timeout.
    #[builder(default)]
    wait_for_events_timeouts: u32,
    /// Answer `closeSession` with HTTP 500.
    #[builder(default)]
    fail_close: bool,
    /// Answer `readImageBlock` with HTTP 500.
    #[builder(default)]
    fail_block_reads: bool,
    cloud: Option<FakeCloudRelay>,
    #[builder(skip)]
    state: Mutex<FakeState>,
}

impl FakeScanner {
    /// Scanner root for direct-mode sessions.
    pub fn direct_url(&self) -> Result<Url, DecodeError> {
        Ok(Url::parse(FAKE_SCANNER_URL)?)
    }

    /// Scanner root for cloud-mode sessions, relayed through the fake API.
    pub fn cloud_scanner_url(&self) -> Result<Url, DecodeError> {
        let api_root = Url::parse(FAKE_CLOUD_API_ROOT)?;
        Ok(append_path(&api_root, &format!("scanners/{FAKE_CLOUD_SCANNER_ID}")))
    }

    /// Direct-mode command endpoint advertised by infoex.
    pub fn endpoint_url(&self) -> Result<Url, DecodeError> {
        Ok(append_path(&self.direct_url()?, API_PATH))
    }

    #[must_use]
    pub fn privet_token(&self) -> &str {
        &self.privet_token
    }

    /// Total number of blocks a capture produces.
    #[must_use]
    pub fn block_count(&self) -> u32 {
        self.images * self.parts_per_image
    }

    /// Bytes the assembled file for `image` (1-based) should contain.
    #[must_use]
    pub fn expected_image(&self, image: u32) -> Vec<u8> {
        (1..=self.parts_per_image)
            .flat_map(|part| block_payload(image, part))
            .collect()
    }

    /// Command methods received so far, in order.
    #[must_use]
    pub fn received_methods(&self) -> Vec<String> {
        self.lock().methods.clone()
    }

    /// `(imageBlockNum, lastImageBlockNum)` of every `releaseImageBlocks`
    /// call, in order.
    #[must_use]
    pub fn released_ranges(&self) -> Vec<(u64, u64)> {
        self.lock().releases.clone()
    }

    /// Block numbers ready and not yet released.
    #[must_use]
    pub fn ready_blocks(&self) -> Vec<u32> {
        self.lock().ready.iter().copied().collect()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, url: &Url) -> Route {
        let url = url.as_str();
        if let Some(rest) = url.strip_prefix(FAKE_SCANNER_URL) {
            return Route::Scanner {
                path: format!("/{rest}"),
                cloud: false,
            };
        }
        let Some(rest) = url.strip_prefix(FAKE_CLOUD_API_ROOT) else {
            return Route::Unknown;
        };
        if self.cloud.is_none() {
            return Route::Unknown;
        }
        match rest.strip_prefix(&format!("scanners/{FAKE_CLOUD_SCANNER_ID}")) {
            Some(path) => Route::Scanner {
                path: path.to_string(),
                cloud: true,
            },
            None => Route::CloudApi(rest.to_string()),
        }
    }

    fn handle_cloud_api(&self, relay: &FakeCloudRelay, method: HttpMethod, path: &str) -> HttpResponse {
        match (method, path) {
            (HttpMethod::Get, "user") => json_response(&json!({
                "eventBroker": {
                    "type": "mqtt",
                    "url": "wss://fake-broker.local/mqtt",
                    "topic": relay.topic,
                }
            })),
            (HttpMethod::Get, "scanners") => json_response(&json!([{
                "id": FAKE_CLOUD_SCANNER_ID,
                "name": "Fake Scanner",
                "description": "Simulated TWAIN Direct scanner",
            }])),
            _ => HttpResponse::new(404, r#"{"message":"Not Found"}"#),
        }
    }

    fn handle_scanner(&self, request: &HttpRequest, path: &str, cloud: bool) -> Result<HttpResponse, HttpError> {
        let response = match (request.method, path) {
            (HttpMethod::Get, INFOEX_PATH) => json_response(&json!({
                "type": "twaindirect",
                "version": "1.0",
                "x-privet-token": self.privet_token,
                "api": [API_PATH],
                "manufacturer": "TWAIN Working Group",
                "model": "Fake Scanner",
            })),
            (HttpMethod::Post, API_PATH) => self.handle_command(request, cloud)?,
            (HttpMethod::Get, block) if cloud => {
                match block
                    .strip_prefix("/blocks/")
                    .and_then(|id| id.parse::<u32>().ok())
                {
                    Some(number) => self.block_bytes(number),
                    None => HttpResponse::new(404, "no such block"),
                }
            }
            _ => HttpResponse::new(404, "not found"),
        };
        Ok(response)
    }

    fn block_bytes(&self, number: u32) -> HttpResponse {
        let Some((image, part)) = self.locate(number) else {
            return HttpResponse::new(404, "no such block");
        };
        HttpResponse::new(200, block_payload(image, part))
            .with_header(CONTENT_TYPE_HEADER, "application/pdf")
    }

    fn handle_command(&self, request: &HttpRequest, cloud: bool) -> Result<HttpResponse, HttpError> {
        if request.header(PRIVET_TOKEN_HEADER) != Some(self.privet_token.as_str()) {
            return Ok(HttpResponse::new(400, r#"{"error":"invalid_x_privet_token"}"#));
        }
        let Some(command) = request
            .body
            .as_deref()
            .and_then(|body| serde_json::from_slice::<Value>(body).ok())
        else {
            return Ok(HttpResponse::new(400, r#"{"error":"invalidJson"}"#));
        };
        let method = command["method"].as_str().unwrap_or_default().to_string();
        let command_id = command["commandId"].clone();
        let params = command.get("params").cloned().unwrap_or(Value::Null);
        debug!(%method, "fake scanner received command");

        let mut state = self.lock();
        state.methods.push(method.clone());
        let results = match method.as_str() {
            "createSession" => Some(self.create_session(&mut state)),
            "sendTask" => Some(self.send_task(&mut state, &params)),
            "startCapturing" => Some(self.start_capturing(&mut state)),
            "stopCapturing" => Some(self.stop_capturing(&mut state)),
            "waitForEvents" => {
                let poll = state.polls;
                state.polls += 1;
                if poll < self.wait_for_events_timeouts {
                    return Err(HttpError::Timeout);
                }
                if poll < self.wait_for_events_timeouts + self.wait_for_events_failures {
                    return Ok(HttpResponse::new(500, "scanner poll failure"));
                }
                Some(self.wait_for_events(&state, &params))
            }
            "readImageBlock" => {
                if self.fail_block_reads {
                    return Ok(HttpResponse::new(500, "block read failure"));
                }
                return Ok(self.read_image_block(&state, &method, &command_id, &params, cloud));
            }
            "releaseImageBlocks" => Some(self.release_image_blocks(&mut state, &params)),
            "closeSession" => {
                if self.fail_close {
                    return Ok(HttpResponse::new(500, "close failure"));
                }
                Some(self.close_session(&mut state))
            }
            _ => None,
        };
        let results = results.unwrap_or_else(|| {
            json!({"success": false, "code": "invalidCommand"})
        });
        Ok(command_response(&command_id, &method, results))
    }

    fn session_value(&self, state: &FakeState) -> Value {
        let mut session = json!({
            "sessionId": state.session_id,
            "revision": state.revision,
            "state": state.state.to_string(),
            "status": {"success": true, "detected": "nominal"},
            "doneCapturing": state.done_capturing,
            "imageBlocksDrained": state.done_capturing && state.ready.is_empty(),
            "imageBlocks": state.ready.iter().collect::<Vec<_>>(),
        });
        if let Some(task) = &state.task {
            session["task"] = task.clone();
        }
        session
    }

    fn create_session(&self, state: &mut FakeState) -> Value {
        if state.state != SessionState::NoSession {
            return json!({"success": false, "code": "busy"});
        }
        state.sessions_created += 1;
        state.session_id = Some(format!("fake-session-{}", state.sessions_created));
        state.state = SessionState::Ready;
        state.done_capturing = false;
        state.captured = false;
        state.ready.clear();
        state.task = None;
        state.revision += 1;
        json!({"success": true, "session": self.session_value(state)})
    }

    fn send_task(&self, state: &mut FakeState, params: &Value) -> Value {
        if state.state != SessionState::Ready {
            return json!({"success": false, "code": "invalidState"});
        }
        let mut task = params.get("task").cloned().unwrap_or_else(|| json!({}));
        if let Some(actions) = task.get_mut("actions").and_then(Value::as_array_mut) {
            for action in actions {
                action["exception"] = json!("ignore");
            }
        }
        state.task = Some(task);
        state.revision += 1;
        json!({"success": true, "session": self.session_value(state)})
    }

    fn start_capturing(&self, state: &mut FakeState) -> Value {
        if state.state != SessionState::Ready {
            return json!({"success": false, "code": "invalidState"});
        }
        state.state = SessionState::Capturing;
        if !state.captured {
            state.ready = (1..=self.block_count()).collect();
            state.captured = true;
            state.done_capturing = true;
        }
        state.revision += 1;
        json!({"success": true, "session": self.session_value(state)})
    }

    fn stop_capturing(&self, state: &mut FakeState) -> Value {
        if state.state != SessionState::Capturing {
            return json!({"success": false, "code": "invalidState"});
        }
        state.state = if state.ready.is_empty() {
            SessionState::Ready
        } else {
            SessionState::Draining
        };
        state.revision += 1;
        json!({"success": true, "session": self.session_value(state)})
    }

    fn wait_for_events(&self, state: &FakeState, params: &Value) -> Value {
        let seen = params["sessionRevision"].as_u64().unwrap_or_default();
        let events = if state.session_id.is_some() && seen < state.revision {
            vec![json!({"event": "sessionUpdated", "session": self.session_value(state)})]
        } else {
            Vec::new()
        };
        json!({"success": true, "events": events})
    }

    fn read_image_block(
        &self,
        state: &FakeState,
        method: &str,
        command_id: &Value,
        params: &Value,
        cloud: bool,
    ) -> HttpResponse {
        let number = params["imageBlockNum"]
            .as_u64()
            .and_then(|number| u32::try_from(number).ok())
            .unwrap_or_default();
        let located = self.locate(number).filter(|_found| state.ready.contains(&number));
        let Some((image, part)) = located else {
            let results = json!({"success": false, "code": "invalidImageBlockNumber"});
            return command_response(command_id, method, results);
        };

        let more_parts = if part == self.parts_per_image {
            "lastPartInFile"
        } else {
            "morePartsInFile"
        };
        let metadata = json!({
            "status": {"success": true},
            "address": {
                "imageNumber": image,
                "imagePart": part,
                "moreParts": more_parts,
                "sheetNumber": image,
                "source": "feederFront",
            }
        });
        let mut results = json!({
            "success": true,
            "session": self.session_value(state),
            "metadata": metadata,
        });
        if cloud {
            results["imageBlockId"] = json!(number.to_string());
            return command_response(command_id, method, results);
        }

        let reply = json!({
            "kind": PROTOCOL_KIND,
            "commandId": command_id,
            "method": method,
            "results": results,
        });
        let body = multipart::encode_block(
            BLOCK_BOUNDARY,
            &reply,
            &block_payload(image, part),
            "application/pdf",
        );
        HttpResponse::new(200, body).with_header(
            CONTENT_TYPE_HEADER,
            format!("multipart/mixed; boundary={BLOCK_BOUNDARY}"),
        )
    }

    fn release_image_blocks(&self, state: &mut FakeState, params: &Value) -> Value {
        let from = params["imageBlockNum"].as_u64().unwrap_or_default();
        let to = params["lastImageBlockNum"].as_u64().unwrap_or(from);
        state.releases.push((from, to));
        state
            .ready
            .retain(|number| !(from..=to).contains(&u64::from(*number)));

        if state.done_capturing && state.ready.is_empty() {
            state.state = match state.state {
                SessionState::Closed => SessionState::NoSession,
                SessionState::Capturing | SessionState::Draining => SessionState::Ready,
                other => other,
            };
        }
        state.revision += 1;
        json!({"success": true, "session": self.session_value(state)})
    }

    fn close_session(&self, state: &mut FakeState) -> Value {
        if state.state == SessionState::NoSession {
            return json!({"success": false, "code": "invalidSessionId"});
        }
        state.state = if state.ready.is_empty() {
            SessionState::NoSession
        } else {
            SessionState::Closed
        };
        state.revision += 1;
        json!({"success": true, "session": self.session_value(state)})
    }

    /// Maps a block number to `(image, part)`, both 1-based.
    fn locate(&self, number: u32) -> Option<(u32, u32)> {
        if number == 0 || number > self.block_count() {
            return None;
        }
        let index = number - 1;
        Some((
            index / self.parts_per_image + 1,
            index % self.parts_per_image + 1,
        ))
    }

    fn relay(&self, relay: &FakeCloudRelay, response: &HttpResponse) -> HttpResponse {
        let envelope = json!({
            "headers": {"content-type": JSON_CONTENT_TYPE},
            "statusCode": response.status,
            "body": response.body_text(),
        });
        let delivered = relay.publisher.publish(&relay.topic, envelope.to_string());
        debug!(delivered, "fake relay published reply");
        json_response(&json!({}))
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Scanner { path: String, cloud: bool },
    CloudApi(String),
    Unknown,
}

#[async_trait]
impl HttpClient for FakeScanner {
    #[instrument(skip(self, request), level = "debug", fields(method = %request.method, url = %request.url))]
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, HttpError> {
        let (path, cloud_api) = match self.route(&request.url) {
            Route::Unknown => return Ok(HttpResponse::new(404, "not found")),
            Route::Scanner { path, cloud: false } => return self.handle_scanner(&request, &path, false),
            Route::Scanner { path, cloud: true } => (path, false),
            Route::CloudApi(path) => (path, true),
        };
        let Some(relay) = &self.cloud else {
            return Ok(HttpResponse::new(404, "not found"));
        };
        if request.header(AUTHORIZATION_HEADER).is_none_or(str::is_empty) {
            return Ok(HttpResponse::new(401, r#"{"message":"Unauthorized"}"#));
        }
        if cloud_api {
            return Ok(self.handle_cloud_api(relay, request.method, &path));
        }

        let response = self.handle_scanner(&request, &path, true)?;
        // Block downloads come straight back; everything else rides the relay.
        if path.starts_with("/blocks/") {
            Ok(response)
        } else {
            Ok(self.relay(relay, &response))
        }
    }
}

fn block_payload(image: u32, part: u32) -> Vec<u8> {
    format!("%PDF-fake image {image} part {part}\n").into_bytes()
}

fn json_response(value: &Value) -> HttpResponse {
    HttpResponse::new(200, value.to_string()).with_header(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE)
}

fn command_response(command_id: &Value, method: &str, results: Value) -> HttpResponse {
    json_response(&json!({
        "kind": PROTOCOL_KIND,
        "commandId": command_id,
        "method": method,
        "results": results,
    }))
}
