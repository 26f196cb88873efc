//! Wire format of the gateway socket. One JSON object per text frame.
//!
//! Client → server:
//!
//! ```json
//! {"id": "1", "type": "auth", "pin": "482913"}
//! {"id": "2", "type": "call", "method": "echo.ping", "params": {}}
//! {"id": "3", "type": "subscribe", "channel": "notifications"}
//! {"id": "4", "type": "unsubscribe", "channel": "notifications"}
//! ```
//!
//! Server → client:
//!
//! ```json
//! {"id": null, "type": "auth_required"}
//! {"id": "1", "type": "auth_success"}
//! {"id": "2", "type": "result", "data": {}}
//! {"id": "5", "type": "subscription", "channel": "stream-42", "data": {"type": "data", "data": 1}}
//! {"id": null, "type": "error", "error": "Invalid message format"}
//! ```
//!
//! Field names are part of the contract with the browser client and must not
//! change.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `type` of a client request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Auth,
    Call,
    Subscribe,
    Unsubscribe,
}

/// A parsed client request.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
    #[serde(default)]
    pub pin: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

impl ClientMessage {
    /// Parse a text frame. `None` for anything that is not a well-formed request.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

/// `type` of a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    AuthRequired,
    AuthSuccess,
    AuthFailed,
    Result,
    Error,
    Subscription,
}

/// A server response. `id` is always present (possibly `null`); the other
/// optional fields are omitted when empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerMessage {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ResponseType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl ServerMessage {
    fn bare(id: Option<String>, kind: ResponseType) -> Self {
        Self {
            id,
            kind,
            data: None,
            error: None,
            channel: None,
        }
    }

    pub fn auth_required() -> Self {
        Self::bare(None, ResponseType::AuthRequired)
    }

    pub fn auth_success(id: Option<String>) -> Self {
        Self::bare(id, ResponseType::AuthSuccess)
    }

    pub fn auth_failed(id: Option<String>, reason: &str) -> Self {
        Self {
            error: Some(reason.to_string()),
            ..Self::bare(id, ResponseType::AuthFailed)
        }
    }

    pub fn result(id: Option<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::bare(id, ResponseType::Result)
        }
    }

    pub fn error(id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::bare(id, ResponseType::Error)
        }
    }

    pub fn subscription(id: Option<String>, channel: &str, data: Value) -> Self {
        Self {
            data: Some(data),
            channel: Some(channel.to_string()),
            ..Self::bare(id, ResponseType::Subscription)
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One event of a shared stream, as seen by every observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Data { data: Value },
    Error { error: String },
    Complete,
}

impl StreamEvent {
    /// Completion and error end the upstream call.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Data { .. })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
