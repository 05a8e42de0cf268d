//! Line protocol messages.
//!
//! Inbound messages carry either a `type` tag (code execution, callback
//! responses) or an `action` tag (skill bridge requests). Both schemes share
//! one stream, so [`Inbound::parse`] classifies on whichever tag is present,
//! preferring `type`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::report::SkillReport;
use crate::stats::StatsSnapshot;

// ============================================================================
// RequestId
// ============================================================================

/// Caller-supplied correlation id.
///
/// Hosts use either numbers or strings. The id is echoed back with the same
/// JSON type it arrived with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    Text(String),
}

impl RequestId {
    /// Extract a request id from a raw JSON value, if it has a usable shape.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(RequestId::Number),
            Value::String(s) => Some(RequestId::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Text(s.to_string())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// A line that could not be turned into an [`Inbound`] message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("message has no 'type' or 'action' field")]
    MissingDiscriminator { request_id: Option<RequestId> },

    #[error("unknown {field}: {value}")]
    UnknownKind {
        field: &'static str,
        value: String,
        request_id: Option<RequestId>,
    },

    #[error("malformed '{kind}' message: {source}")]
    Malformed {
        kind: String,
        request_id: Option<RequestId>,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// The correlation id of the offending message, when one could be read.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            ProtocolError::InvalidJson(_) | ProtocolError::NotAnObject => None,
            ProtocolError::MissingDiscriminator { request_id }
            | ProtocolError::UnknownKind { request_id, .. }
            | ProtocolError::Malformed { request_id, .. } => request_id.as_ref(),
        }
    }
}

// ============================================================================
// Inbound
// ============================================================================

/// `{"type": "execute"}`: evaluate guest code in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub id: RequestId,
    pub code: String,
    /// Local overlay. `null` and absent both mean empty.
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub context: Map<String, Value>,
}

/// `{"type": "call-response"}`: the host's answer to a `call-request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResponse {
    #[serde(rename = "correlationId")]
    pub correlation_id: u64,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// `{"action": "execute"}`: run a skill package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillRequest {
    #[serde(rename = "requestId", default)]
    pub request_id: Option<RequestId>,
    /// Optional on the wire so a missing name can be answered with an error
    /// that still carries the request id.
    #[serde(default)]
    pub skill: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty_map")]
    pub params: Map<String, Value>,
    /// Deadline in seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

/// A classified host → worker message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Execute(ExecuteRequest),
    CallResponse(CallResponse),
    Skill(SkillRequest),
    Stats { request_id: Option<RequestId> },
    ClearCache { request_id: Option<RequestId> },
    Ping { request_id: Option<RequestId> },
    Shutdown { request_id: Option<RequestId> },
}

#[derive(Debug, Clone, Copy, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
enum MessageType {
    Execute,
    CallResponse,
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, Copy, EnumString, Display)]
#[strum(serialize_all = "kebab-case")]
enum Action {
    Execute,
    Stats,
    Ping,
    Shutdown,
    ClearCache,
}

impl Inbound {
    /// Parse and classify one protocol line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(line).map_err(ProtocolError::InvalidJson)?;
        let Value::Object(obj) = &value else {
            return Err(ProtocolError::NotAnObject);
        };

        let request_id = obj
            .get("id")
            .or_else(|| obj.get("requestId"))
            .and_then(RequestId::from_value);

        if let Some(tag) = obj.get("type") {
            let tag = tag_text(tag);
            let kind = MessageType::from_str(&tag).map_err(|_| ProtocolError::UnknownKind {
                field: "type",
                value: tag.clone(),
                request_id: request_id.clone(),
            })?;
            return Self::from_type(kind, value, request_id);
        }

        if let Some(tag) = obj.get("action") {
            let tag = tag_text(tag);
            let action = Action::from_str(&tag).map_err(|_| ProtocolError::UnknownKind {
                field: "action",
                value: tag.clone(),
                request_id: request_id.clone(),
            })?;
            return Self::from_action(action, value, request_id);
        }

        Err(ProtocolError::MissingDiscriminator { request_id })
    }

    fn from_type(
        kind: MessageType,
        value: Value,
        request_id: Option<RequestId>,
    ) -> Result<Self, ProtocolError> {
        let malformed = |source| ProtocolError::Malformed {
            kind: kind.to_string(),
            request_id: request_id.clone(),
            source,
        };
        match kind {
            MessageType::Execute => serde_json::from_value(value)
                .map(Inbound::Execute)
                .map_err(malformed),
            MessageType::CallResponse => serde_json::from_value(value)
                .map(Inbound::CallResponse)
                .map_err(malformed),
            MessageType::Ping => Ok(Inbound::Ping { request_id }),
            MessageType::Shutdown => Ok(Inbound::Shutdown { request_id }),
        }
    }

    fn from_action(
        action: Action,
        value: Value,
        request_id: Option<RequestId>,
    ) -> Result<Self, ProtocolError> {
        match action {
            Action::Execute => serde_json::from_value(value)
                .map(Inbound::Skill)
                .map_err(|source| ProtocolError::Malformed {
                    kind: action.to_string(),
                    request_id,
                    source,
                }),
            Action::Stats => Ok(Inbound::Stats { request_id }),
            Action::Ping => Ok(Inbound::Ping { request_id }),
            Action::Shutdown => Ok(Inbound::Shutdown { request_id }),
            Action::ClearCache => Ok(Inbound::ClearCache { request_id }),
        }
    }
}

fn tag_text(tag: &Value) -> String {
    match tag {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn null_as_empty_map<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Outbound
// ============================================================================

/// A worker → host message. Serialized as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Outbound {
    /// Emitted once, before the first line is read.
    Ready { message: String, version: String },

    /// Answer to an `execute` request.
    Response {
        id: RequestId,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Guest code asking the host to run a named operation.
    CallRequest {
        #[serde(rename = "correlationId")]
        correlation_id: u64,
        target: String,
        operation: String,
        args: Vec<Value>,
    },

    Log { message: String },

    /// Outcome of a skill invocation.
    Result {
        #[serde(rename = "requestId")]
        request_id: Option<RequestId>,
        #[serde(flatten)]
        report: SkillReport,
    },

    Stats {
        #[serde(rename = "requestId")]
        request_id: Option<RequestId>,
        stats: StatsSnapshot,
    },

    Pong {
        #[serde(rename = "requestId")]
        request_id: Option<RequestId>,
    },

    /// Acknowledges a shutdown request.
    Shutdown {
        message: String,
        #[serde(rename = "requestId")]
        request_id: Option<RequestId>,
    },

    Error {
        success: bool,
        error: String,
        #[serde(rename = "requestId")]
        request_id: Option<RequestId>,
    },
}

impl Outbound {
    pub fn response_ok(id: RequestId, result: Value) -> Self {
        Outbound::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: RequestId, error: impl Into<String>) -> Self {
        Outbound::Response {
            id,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Outbound::Log {
            message: message.into(),
        }
    }

    pub fn error(error: impl Into<String>, request_id: Option<RequestId>) -> Self {
        Outbound::Error {
            success: false,
            error: error.into(),
            request_id,
        }
    }

    /// Serialize to a single line (no trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_execute() {
        let msg = Inbound::parse(r#"{"type":"execute","id":7,"code":"1 + 1"}"#).unwrap();
        match msg {
            Inbound::Execute(req) => {
                assert_eq!(req.id, RequestId::Number(7));
                assert_eq!(req.code, "1 + 1");
                assert!(req.context.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_execute_null_context() {
        let msg =
            Inbound::parse(r#"{"type":"execute","id":"a","code":"x","context":null}"#).unwrap();
        assert!(matches!(msg, Inbound::Execute(req) if req.context.is_empty()));
    }

    #[test]
    fn test_parse_skill_action() {
        let line = r#"{"action":"execute","requestId":"r1","skill":"greet","params":{"name":"Ada"},"timeout":5}"#;
        match Inbound::parse(line).unwrap() {
            Inbound::Skill(req) => {
                assert_eq!(req.request_id, Some(RequestId::from("r1")));
                assert_eq!(req.skill.as_deref(), Some("greet"));
                assert_eq!(req.params.get("name"), Some(&json!("Ada")));
                assert_eq!(req.timeout, Some(5.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_type_takes_precedence_over_action() {
        let msg = Inbound::parse(r#"{"type":"ping","action":"stats","requestId":3}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Ping {
                request_id: Some(RequestId::Number(3))
            }
        );
    }

    #[test]
    fn test_parse_call_response() {
        let msg =
            Inbound::parse(r#"{"type":"call-response","correlationId":4,"error":"boom"}"#).unwrap();
        match msg {
            Inbound::CallResponse(resp) => {
                assert_eq!(resp.correlation_id, 4);
                assert_eq!(resp.error.as_deref(), Some("boom"));
                assert!(resp.result.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_keeps_request_id() {
        let err = Inbound::parse(r#"{"type":"frobnicate","id":12}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind { field: "type", .. }));
        assert_eq!(err.request_id(), Some(&RequestId::Number(12)));
    }

    #[test]
    fn test_invalid_json() {
        let err = Inbound::parse("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
        assert!(err.request_id().is_none());
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(
            Inbound::parse("[1,2]").unwrap_err(),
            ProtocolError::NotAnObject
        ));
    }

    #[test]
    fn test_malformed_execute() {
        let err = Inbound::parse(r#"{"type":"execute","id":1}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
        assert_eq!(err.request_id(), Some(&RequestId::Number(1)));
    }

    #[test]
    fn test_outbound_call_request_shape() {
        let msg = Outbound::CallRequest {
            correlation_id: 0,
            target: "dataFilter".into(),
            operation: "apply".into(),
            args: vec![json!(1), json!("two")],
        };
        let value: Value = serde_json::from_str(&msg.to_line().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "call-request",
                "correlationId": 0,
                "target": "dataFilter",
                "operation": "apply",
                "args": [1, "two"],
            })
        );
    }

    #[test]
    fn test_outbound_response_echoes_id_type() {
        let line = Outbound::response_ok(RequestId::from("abc"), json!(2))
            .to_line()
            .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({"type": "response", "id": "abc", "result": 2}));

        let line = Outbound::response_err(RequestId::Number(9), "nope")
            .to_line()
            .unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value, json!({"type": "response", "id": 9, "error": "nope"}));
    }

    #[test]
    fn test_outbound_error_shape() {
        let line = Outbound::error("bad", None).to_line().unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "success": false, "error": "bad", "requestId": null})
        );
    }
}
