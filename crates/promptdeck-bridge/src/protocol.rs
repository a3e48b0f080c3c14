//! Wire protocol types for host-worker communication.
//!
//! One message per line, UTF-8 JSON. Discrimination is structural: a
//! `Notification` carries a `"type"` tag, a `Request` always has `"method"`,
//! and a `Response` always has `"success"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single frame on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Notification(Notification),
    Request(Request),
    Response(Response),
}

/// Unsolicited worker-to-host messages, tagged with `"type"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// Startup sentinel, emitted exactly once when the worker can accept work.
    Ready,

    /// Not a reply to any request; published to event subscribers.
    Event { data: Value },
}

/// Host-to-worker request carrying a correlation id.
///
/// Ids are monotonically increasing and never recycled for the lifetime of
/// the bridge, so a late answer can never be matched to the wrong call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    /// `namespace/action`, e.g. `project/get_tree` or `token/count`.
    pub method: String,
    pub params: Value,
}

/// Worker-to-host reply matched against an outstanding request by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Collapse the wire shape into the caller-facing result. A success with
    /// no `result` field is a null result; a failure with no `error` field
    /// still fails, with a placeholder message.
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| "worker reported failure without a message".to_string()))
        }
    }
}
