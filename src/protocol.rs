use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum_macros::{Display, EnumIter, EnumString};
use uuid::Uuid;

use crate::error::{DecodeError, SessionError, TwainError};

/// `kind` value carried by every TWAIN Local command envelope.
pub(crate) const PROTOCOL_KIND: &str = "twainlocalscanner";
/// Header carrying the privet token on every scanner request.
pub(crate) const PRIVET_TOKEN_HEADER: &str = "X-Privet-Token";
pub(crate) const AUTHORIZATION_HEADER: &str = "Authorization";
pub(crate) const CONTENT_TYPE_HEADER: &str = "Content-Type";
pub(crate) const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";
/// Device discovery path, relative to the scanner root.
pub(crate) const INFOEX_PATH: &str = "/privet/infoex";
/// Key used to wrap bare JSON arrays into an object.
pub const ARRAY_KEY: &str = "array";

/// Session states reported by the scanner.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase")]
pub enum SessionState {
    NoSession,
    Ready,
    Capturing,
    Closed,
    Draining,
}

/// Conditions reported in `session.status.detected`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "camelCase")]
pub enum StatusDetected {
    Nominal,
    CoverOpen,
    FoldedCorner,
    ImageError,
    Misfeed,
    DoubleFeed,
    Multifeed,
    PaperJam,
    NoMedia,
    Staple,
}

/// Image part markers carried in block metadata.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum MoreParts {
    LastPartInFile,
    MorePartsInFile,
    LastPartInFileMorePartsPending,
}

impl MoreParts {
    /// Returns whether this block closes an image.
    #[must_use]
    pub fn ends_image(self) -> bool {
        !matches!(self, Self::MorePartsInFile)
    }
}

/// Protocol commands issued to the scanner endpoint.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
#[strum(serialize_all = "camelCase")]
pub enum CommandMethod {
    CreateSession,
    SendTask,
    StartCapturing,
    StopCapturing,
    CloseSession,
    WaitForEvents,
    ReadImageBlock,
    ReleaseImageBlocks,
}

/// Locally generated correlation id embedded in each command.
#[derive(Debug, Clone, Eq, PartialEq, Hash, derive_more::Display, derive_more::From, derive_more::Into)]
#[display("{_0}")]
pub struct CommandId(String);

impl CommandId {
    /// Generates a fresh random command id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Outgoing command body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    kind: &'static str,
    command_id: String,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

impl CommandEnvelope {
    /// Builds an envelope with a fresh command id.
    #[must_use]
    pub fn new(method: CommandMethod, params: Option<Value>) -> Self {
        Self::with_id(CommandId::generate(), method, params)
    }

    pub(crate) fn with_id(command_id: CommandId, method: CommandMethod, params: Option<Value>) -> Self {
        Self {
            kind: PROTOCOL_KIND,
            command_id: command_id.into(),
            method: method.to_string(),
            params,
        }
    }

    #[must_use]
    pub fn command_id(&self) -> CommandId {
        CommandId::from(self.command_id.clone())
    }

    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    pub(crate) fn to_body(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// `results.session.status` object.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionStatus {
    pub success: Option<bool>,
    pub detected: Option<String>,
}

/// Session object embedded in command results and events.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionObject {
    pub session_id: Option<String>,
    pub revision: u64,
    pub state: String,
    pub status: Option<SessionStatus>,
    pub done_capturing: Option<bool>,
    pub image_blocks_drained: Option<bool>,
    #[serde(default)]
    pub image_blocks: Vec<u32>,
    pub task: Option<Value>,
}

impl SessionObject {
    pub(crate) fn from_value(value: &Value) -> Result<Self, DecodeError> {
        Ok(Self::deserialize(value)?)
    }

    /// Parses the embedded state string.
    pub(crate) fn parsed_state(&self) -> Result<SessionState, SessionError> {
        self.state
            .parse()
            .map_err(|_unknown| SessionError::UnknownState {
                value: self.state.clone(),
            })
    }

    /// Parses the embedded `status.detected` string, if present.
    pub(crate) fn parsed_detected(&self) -> Result<Option<StatusDetected>, DecodeError> {
        let Some(value) = self.status.as_ref().and_then(|status| status.detected.as_ref()) else {
            return Ok(None);
        };
        value
            .parse()
            .map(Some)
            .map_err(|_unknown| DecodeError::UnknownStatusDetected {
                value: value.clone(),
            })
    }
}

/// Extracts `results` from a command response, failing on `success=false`.
pub(crate) fn command_results(method: &str, response: &Value) -> Result<Value, TwainError> {
    let results = response
        .get("results")
        .filter(|results| results.is_object())
        .ok_or(DecodeError::MissingField { field: "results" })?;
    let success = results
        .get("success")
        .and_then(Value::as_bool)
        .ok_or(DecodeError::MissingField { field: "results.success" })?;
    if !success {
        return Err(SessionError::CommandFailed {
            method: method.to_string(),
            results: results.clone(),
        }
        .into());
    }
    Ok(results.clone())
}

/// Returns `results.session` decoded as a session object.
pub(crate) fn results_session(results: &Value) -> Result<SessionObject, DecodeError> {
    let session = results
        .get("session")
        .ok_or(DecodeError::MissingField { field: "results.session" })?;
    SessionObject::from_value(session)
}

/// Decodes a response body, wrapping bare arrays as `{"array": [...]}`.
pub fn normalise_json_body(body: &[u8]) -> Result<Value, DecodeError> {
    let value: Value = serde_json::from_slice(body)?;
    match value {
        Value::Object(_) => Ok(value),
        Value::Array(items) => {
            let mut root = Map::new();
            root.insert(ARRAY_KEY.to_string(), Value::Array(items));
            Ok(Value::Object(root))
        }
        Value::Null => Err(DecodeError::UnexpectedShape { kind: "null" }),
        Value::Bool(_) => Err(DecodeError::UnexpectedShape { kind: "boolean" }),
        Value::Number(_) => Err(DecodeError::UnexpectedShape { kind: "number" }),
        Value::String(_) => Err(DecodeError::UnexpectedShape { kind: "string" }),
    }
}

/// Device discovery (`/privet/infoex`) fields used by the session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    privet_token: String,
    api_path: String,
    manufacturer: Option<String>,
    model: Option<String>,
    version: Option<String>,
}

impl DeviceInfo {
    pub(crate) fn from_value(value: &Value) -> Result<Self, SessionError> {
        let privet_token = value
            .get("x-privet-token")
            .and_then(Value::as_str)
            .ok_or(SessionError::MissingPrivetToken)?
            .to_string();
        let api_path = value
            .get("api")
            .and_then(Value::as_array)
            .and_then(|paths| paths.first())
            .and_then(Value::as_str)
            .ok_or(SessionError::MissingEndpoint)?
            .to_string();
        let text = |field: &str| value.get(field).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            privet_token,
            api_path,
            manufacturer: text("manufacturer"),
            model: text("model"),
            version: text("version"),
        })
    }

    #[must_use]
    pub fn privet_token(&self) -> &str {
        &self.privet_token
    }

    #[must_use]
    pub fn api_path(&self) -> &str {
        &self.api_path
    }

    #[must_use]
    pub fn manufacturer(&self) -> Option<&str> {
        self.manufacturer.as_deref()
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }
}

/// Pub/sub connection descriptor returned by the cloud service.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventBrokerInfo {
    #[serde(rename = "type")]
    pub broker_type: String,
    pub url: String,
    pub topic: String,
}

/// Outer envelope of every message delivered on the response topic.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CloudEnvelope {
    #[serde(default)]
    pub(crate) headers: Option<Value>,
    #[serde(default)]
    pub(crate) status_code: Option<u16>,
    pub(crate) body: Value,
}

impl CloudEnvelope {
    pub(crate) fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Returns the inner body string.
    pub(crate) fn body_text(&self) -> Result<&str, DecodeError> {
        self.body.as_str().ok_or(DecodeError::EnvelopeBody)
    }
}

/// Extracts the correlation id from a delivered body, if it carries one.
pub(crate) fn body_command_id(body: &str) -> Option<CommandId> {
    let value: Value = serde_json::from_str(body).ok()?;
    value
        .get("commandId")
        .and_then(Value::as_str)
        .map(|id| CommandId::from(id.to_string()))
}

/// Metadata carried by one image block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMetadata {
    image_number: Option<u64>,
    image_part: Option<u64>,
    more_parts: MoreParts,
    raw: Value,
}

impl BlockMetadata {
    /// Decodes the readImageBlock `results` object.
    pub(crate) fn from_results(results: &Value) -> Result<Self, DecodeError> {
        let raw = results.get("metadata").cloned().unwrap_or(Value::Null);
        let address = raw.get("address");
        let image_number = address
            .and_then(|address| address.get("imageNumber"))
            .and_then(Value::as_u64);
        let image_part = address
            .and_then(|address| address.get("imagePart"))
            .and_then(Value::as_u64);
        let more_parts = match address
            .and_then(|address| address.get("moreParts"))
            .and_then(Value::as_str)
        {
            Some(value) => value
                .parse()
                .map_err(|_unknown| DecodeError::UnknownMoreParts {
                    value: value.to_string(),
                })?,
            None => MoreParts::LastPartInFile,
        };
        Ok(Self {
            image_number,
            image_part,
            more_parts,
            raw,
        })
    }

    /// Metadata for a block delivered without any JSON part.
    #[must_use]
    pub fn single_part() -> Self {
        Self {
            image_number: None,
            image_part: None,
            more_parts: MoreParts::LastPartInFile,
            raw: Value::Null,
        }
    }

    #[must_use]
    pub fn image_number(&self) -> Option<u64> {
        self.image_number
    }

    #[must_use]
    pub fn image_part(&self) -> Option<u64> {
        self.image_part
    }

    #[must_use]
    pub fn more_parts(&self) -> MoreParts {
        self.more_parts
    }

    /// Raw `metadata` object as sent by the scanner.
    #[must_use]
    pub fn raw(&self) -> &Value {
        &self.raw
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use insta::assert_snapshot;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn session_states_round_trip_through_wire_names() {
        for state in SessionState::iter() {
            let parsed: SessionState = state.to_string().parse().expect("wire name should parse");
            assert_eq!(state, parsed);
        }
        assert_eq!("noSession", SessionState::NoSession.to_string());
    }

    #[rstest]
    #[case("coverOpen", StatusDetected::CoverOpen)]
    #[case("paperJam", StatusDetected::PaperJam)]
    #[case("nominal", StatusDetected::Nominal)]
    fn status_detected_parses_wire_names(#[case] raw: &str, #[case] expected: StatusDetected) {
        assert_eq!(Ok(expected), raw.parse::<StatusDetected>());
    }

    #[test]
    fn envelope_serialises_protocol_fields() {
        let envelope = CommandEnvelope::with_id(
            CommandId::from("abc".to_string()),
            CommandMethod::ReleaseImageBlocks,
            Some(json!({"sessionId": "s1"})),
        );
        let rendered = String::from_utf8(envelope.to_body().expect("envelope should encode"))
            .expect("envelope should be utf-8");

        assert_snapshot!(rendered, @r#"{"kind":"twainlocalscanner","commandId":"abc","method":"releaseImageBlocks","params":{"sessionId":"s1"}}"#);
    }

    #[test]
    fn normalise_wraps_bare_arrays() {
        let value = normalise_json_body(br#"[{"id":"a"}]"#).expect("array should decode");
        assert_eq!(json!({"array": [{"id": "a"}]}), value);
    }

    #[rstest]
    #[case(b"42".as_slice(), "number")]
    #[case(b"\"text\"".as_slice(), "string")]
    #[case(b"null".as_slice(), "null")]
    fn normalise_rejects_scalars(#[case] body: &[u8], #[case] expected_kind: &str) {
        let result = normalise_json_body(body);
        assert_matches!(result, Err(DecodeError::UnexpectedShape { kind }) if kind == expected_kind);
    }

    #[test]
    fn normalise_rejects_invalid_json() {
        assert_matches!(normalise_json_body(b"{not json"), Err(DecodeError::Json(_)));
    }

    #[test]
    fn command_results_reports_failure_with_raw_results() {
        let response = json!({"results": {"success": false, "code": "invalidSessionId"}});
        let result = command_results("sendTask", &response);

        assert_matches!(
            result,
            Err(TwainError::Session(SessionError::CommandFailed { method, results }))
                if method == "sendTask" && results["code"] == "invalidSessionId"
        );
    }

    #[test]
    fn session_object_rejects_unknown_state() {
        let session = SessionObject::from_value(&json!({"revision": 1, "state": "warmingUp"}))
            .expect("shape should decode");
        assert_matches!(
            session.parsed_state(),
            Err(SessionError::UnknownState { value }) if value == "warmingUp"
        );
    }

    #[test]
    fn device_info_requires_token_and_endpoint() {
        let info = DeviceInfo::from_value(&json!({
            "x-privet-token": "tok",
            "api": ["/privet/twaindirect/session"]
        }))
        .expect("infoex should decode");
        assert_eq!("tok", info.privet_token());
        assert_eq!("/privet/twaindirect/session", info.api_path());

        assert_matches!(
            DeviceInfo::from_value(&json!({"api": []})),
            Err(SessionError::MissingPrivetToken)
        );
        assert_matches!(
            DeviceInfo::from_value(&json!({"x-privet-token": ""})),
            Err(SessionError::MissingEndpoint)
        );
    }

    #[rstest]
    #[case(json!({"metadata": {"address": {"imageNumber": 2, "imagePart": 1, "moreParts": "morePartsInFile"}}}), MoreParts::MorePartsInFile, false)]
    #[case(json!({"metadata": {"address": {"moreParts": "lastPartInFileMorePartsPending"}}}), MoreParts::LastPartInFileMorePartsPending, true)]
    #[case(json!({}), MoreParts::LastPartInFile, true)]
    fn block_metadata_reads_part_marker(
        #[case] results: Value,
        #[case] expected: MoreParts,
        #[case] ends_image: bool,
    ) {
        let metadata = BlockMetadata::from_results(&results).expect("metadata should decode");
        assert_eq!(expected, metadata.more_parts());
        assert_eq!(ends_image, metadata.more_parts().ends_image());
    }

    #[test]
    fn body_command_id_reads_top_level_field() {
        assert_eq!(
            Some(CommandId::from("c-1".to_string())),
            body_command_id(r#"{"commandId":"c-1","results":{}}"#)
        );
        assert_eq!(None, body_command_id(r#"{"results":{}}"#));
        assert_eq!(None, body_command_id("not json"));
    }
}
