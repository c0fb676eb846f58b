//! JSON-RPC 2.0 envelope types and inbound message classification.
//!
//! The transport treats payloads opaquely except for what classification
//! needs: requests carry a `method` and an `id`, responses carry an `id`
//! plus `result` or `error`, notifications carry a `method` and no `id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version emitted in every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Request identifier: a string or a signed 64-bit integer.
///
/// The default is the empty string, which counts as unset; the transport
/// generates an id for unset requests on send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(i64),
    Str(String),
}

impl RequestId {
    /// Whether the caller supplied an id (non-empty string or any integer).
    pub fn is_set(&self) -> bool {
        match self {
            RequestId::Num(_) => true,
            RequestId::Str(s) => !s.is_empty(),
        }
    }

    /// Canonical decimal string form used as the correlation-map key.
    pub fn key(&self) -> String {
        match self {
            RequestId::Num(n) => n.to_string(),
            RequestId::Str(s) => s.clone(),
        }
    }
}

impl Default for RequestId {
    fn default() -> Self {
        RequestId::Str(String::new())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Num(n) => write!(f, "{}", n),
            RequestId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Num(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        RequestId::Num(n as i64)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Str(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::Str(s)
    }
}

fn default_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// A JSON-RPC request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    /// Create a request with an unset id; the transport assigns one on send.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: RequestId::default(),
            method: method.into(),
            params,
        }
    }

    /// Create a request with a caller-chosen id.
    pub fn with_id(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC response envelope. Exactly one of `result`/`error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Successful response carrying a result value.
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response from an explicit error object.
    pub fn from_error(id: RequestId, error: ErrorObject) -> Self {
        Self {
            jsonrpc: default_version(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Internal-error response (`-32603`) with the given message.
    pub fn internal_error(id: RequestId, message: impl Into<String>) -> Self {
        Self::from_error(id, ErrorObject::new(error_codes::INTERNAL_ERROR, message))
    }

    /// Whether this response carries an error object.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A JSON-RPC notification envelope (no id, no reply expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: default_version(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A classified inbound message.
#[derive(Debug)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Shape probe for the notification fallthrough: captures any `id` member
/// so request-shaped payloads are never misdelivered as notifications.
#[derive(Deserialize)]
struct NotificationProbe {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

impl Message {
    /// Classify an inbound payload.
    ///
    /// The substring pre-check on `"method"`/`"id"` is an optimization
    /// only; the typed parses below it are authoritative. Returns `None`
    /// for payloads matching no envelope shape.
    pub fn classify(payload: &str) -> Option<Message> {
        if payload.contains("\"method\"") && payload.contains("\"id\"") {
            if let Ok(request) = serde_json::from_str::<Request>(payload) {
                return Some(Message::Request(request));
            }
        }

        if let Ok(response) = serde_json::from_str::<Response>(payload) {
            if response.result.is_some() || response.error.is_some() {
                return Some(Message::Response(response));
            }
        }

        if let Ok(probe) = serde_json::from_str::<NotificationProbe>(payload) {
            if probe.id.is_none() {
                return Some(Message::Notification(Notification {
                    jsonrpc: default_version(),
                    method: probe.method,
                    params: probe.params,
                }));
            }
        }

        None
    }
}
