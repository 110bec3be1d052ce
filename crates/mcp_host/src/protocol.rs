//! JSON-RPC 2.0 envelopes as they appear on the wire.
//!
//! Every message is exactly one of three shapes: a request (`id` + `method`),
//! a response (`id` + exactly one of `result`/`error`), or a notification
//! (`method`, no `id`). Classification happens by field presence; anything
//! else is a protocol violation and the offending line is dropped upstream.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Version tag required on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";
/// MCP protocol revision advertised by this client during the handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC method name used to initialize MCP servers.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Notification sent after a successful `initialize` exchange.
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
/// Catalog listing for tools.
pub const METHOD_TOOLS_LIST: &str = "tools/list";
/// Tool invocation.
pub const METHOD_TOOLS_CALL: &str = "tools/call";
/// Catalog listing for resources.
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
/// Resource retrieval by URI.
pub const METHOD_RESOURCES_READ: &str = "resources/read";

/// Unique identifier for JSON-RPC calls. Ids are issued by a per-connection
/// monotonic counter and never reused within a connection's lifetime.
pub type RequestId = u64;

/// A single JSON-RPC 2.0 message.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        outcome: ResponseOutcome,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// Exactly one of `result` or `error` on a response.
#[derive(Clone, Debug, PartialEq)]
pub enum ResponseOutcome {
    Result(Value),
    Error(RpcError),
}

/// JSON-RPC error object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Ways an incoming line can fail envelope classification.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("`jsonrpc` is absent or not \"2.0\"")]
    Version,
    #[error("request is missing `method`")]
    MissingMethod,
    #[error("`id` must be a non-negative integer")]
    InvalidId,
    #[error("response carries both `result` and `error`")]
    ResultAndError,
    #[error("response carries neither `result` nor `error`")]
    EmptyResponse,
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("invalid JSON: {0}")]
    Json(String),
}

impl Envelope {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Envelope::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request { method, .. } | Envelope::Notification { method, .. } => {
                Some(method)
            }
            Envelope::Response { .. } => None,
        }
    }

    pub fn id(&self) -> Option<RequestId> {
        match self {
            Envelope::Request { id, .. } | Envelope::Response { id, .. } => Some(*id),
            Envelope::Notification { .. } => None,
        }
    }

    /// Serializes into the wire object shape.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".into(), json!(JSONRPC_VERSION));
        match self {
            Envelope::Request { id, method, params } => {
                object.insert("id".into(), json!(id));
                object.insert("method".into(), json!(method));
                if let Some(params) = params {
                    object.insert("params".into(), params.clone());
                }
            }
            Envelope::Response { id, outcome } => {
                object.insert("id".into(), json!(id));
                match outcome {
                    ResponseOutcome::Result(result) => {
                        object.insert("result".into(), result.clone());
                    }
                    ResponseOutcome::Error(error) => {
                        let mut payload = Map::new();
                        payload.insert("code".into(), json!(error.code));
                        payload.insert("message".into(), json!(error.message));
                        if let Some(data) = &error.data {
                            payload.insert("data".into(), data.clone());
                        }
                        object.insert("error".into(), Value::Object(payload));
                    }
                }
            }
            Envelope::Notification { method, params } => {
                object.insert("method".into(), json!(method));
                if let Some(params) = params {
                    object.insert("params".into(), params.clone());
                }
            }
        }
        Value::Object(object)
    }

    /// Serializes into one compact JSON line (without the trailing newline).
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value())
    }

    /// Classifies a decoded JSON value by field presence.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(object) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        match object.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            _ => return Err(EnvelopeError::Version),
        }

        let id = match object.get("id") {
            None => None,
            Some(id) => Some(id.as_u64().ok_or(EnvelopeError::InvalidId)?),
        };
        let method = object
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_owned);
        let params = object.get("params").cloned();

        match (method, id) {
            (Some(method), Some(id)) => Ok(Envelope::Request { id, method, params }),
            (Some(method), None) => Ok(Envelope::Notification { method, params }),
            (None, Some(id)) => {
                let result = object.get("result").cloned();
                let error = object.get("error").cloned();
                match (result, error) {
                    (Some(_), Some(_)) => Err(EnvelopeError::ResultAndError),
                    (Some(result), None) => Ok(Envelope::Response {
                        id,
                        outcome: ResponseOutcome::Result(result),
                    }),
                    (None, Some(error)) => {
                        let error: RpcError = serde_json::from_value(error)
                            .map_err(|err| EnvelopeError::Json(err.to_string()))?;
                        Ok(Envelope::Response {
                            id,
                            outcome: ResponseOutcome::Error(error),
                        })
                    }
                    (None, None) => Err(EnvelopeError::EmptyResponse),
                }
            }
            (None, None) => Err(EnvelopeError::MissingMethod),
        }
    }

    /// Parses one wire line into an envelope.
    pub fn from_line(line: &str) -> Result<Self, EnvelopeError> {
        let value: Value =
            serde_json::from_str(line).map_err(|err| EnvelopeError::Json(err.to_string()))?;
        Self::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(envelope: Envelope) {
        let line = envelope.to_line().expect("encode");
        let decoded = Envelope::from_line(&line).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn round_trips_every_envelope_shape() {
        round_trip(Envelope::request(1, "tools/list", Some(json!({}))));
        round_trip(Envelope::request(7, "tools/call", None));
        round_trip(Envelope::Response {
            id: 2,
            outcome: ResponseOutcome::Result(json!({ "tools": [] })),
        });
        round_trip(Envelope::Response {
            id: 3,
            outcome: ResponseOutcome::Error(RpcError {
                code: -32601,
                message: "method not found".into(),
                data: Some(json!({ "method": "nope" })),
            }),
        });
        round_trip(Envelope::notification(
            "notifications/initialized",
            Some(json!({})),
        ));
        round_trip(Envelope::notification("demo/event", None));
    }

    #[test]
    fn rejects_missing_or_wrong_version() {
        let err = Envelope::from_line(r#"{"id":1,"method":"x"}"#).unwrap_err();
        assert_eq!(err, EnvelopeError::Version);
        let err = Envelope::from_line(r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#).unwrap_err();
        assert_eq!(err, EnvelopeError::Version);
    }

    #[test]
    fn rejects_response_with_both_result_and_error() {
        let line = r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#;
        assert_eq!(
            Envelope::from_line(line).unwrap_err(),
            EnvelopeError::ResultAndError
        );
    }

    #[test]
    fn rejects_response_with_neither_result_nor_error() {
        let line = r#"{"jsonrpc":"2.0","id":1}"#;
        assert_eq!(
            Envelope::from_line(line).unwrap_err(),
            EnvelopeError::EmptyResponse
        );
    }

    #[test]
    fn rejects_request_without_method() {
        let line = r#"{"jsonrpc":"2.0","params":{}}"#;
        assert_eq!(
            Envelope::from_line(line).unwrap_err(),
            EnvelopeError::MissingMethod
        );
    }

    #[test]
    fn rejects_non_numeric_ids() {
        let line = r#"{"jsonrpc":"2.0","id":"abc","method":"x"}"#;
        assert_eq!(
            Envelope::from_line(line).unwrap_err(),
            EnvelopeError::InvalidId
        );
        let line = r#"{"jsonrpc":"2.0","id":-4,"method":"x"}"#;
        assert_eq!(
            Envelope::from_line(line).unwrap_err(),
            EnvelopeError::InvalidId
        );
    }

    #[test]
    fn rejects_non_objects() {
        assert_eq!(
            Envelope::from_line("[1,2,3]").unwrap_err(),
            EnvelopeError::NotAnObject
        );
        assert!(matches!(
            Envelope::from_line("not json at all"),
            Err(EnvelopeError::Json(_))
        ));
    }
}
