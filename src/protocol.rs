//! Wire protocol shared by the client and agent paths.
//!
//! Every message is a complete JSON object carrying a `type` field. Inbound
//! frames are matched on `type` first and then decoded into the typed frames
//! below; outbound frames are serialized from typed structs so field casing
//! stays consistent across the daemon.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Per-connection outbound queue handle. Writes through it are serialized
/// by the connection's send task, so interleaved frames cannot corrupt each
/// other.
pub type OutboundTx = mpsc::UnboundedSender<Message>;

pub fn send_json<T: Serialize>(tx: &OutboundTx, payload: &T) -> Result<(), ()> {
    let text = serde_json::to_string(payload).map_err(|_| ())?;
    tx.send(Message::Text(text.into())).map_err(|_| ())
}

/// Send a pre-serialized JSON string. Used by broadcast paths to avoid
/// re-serializing the same frame per connection.
pub fn send_text(tx: &OutboundTx, text: String) -> Result<(), ()> {
    tx.send(Message::Text(text.into())).map_err(|_| ())
}

pub fn send_close(tx: &OutboundTx, code: u16, reason: &str) -> Result<(), ()> {
    // Truncate close reason to 123 bytes to fit the WebSocket limit
    let truncated_reason: String = reason.chars().take(123).collect();
    let frame = CloseFrame {
        code,
        reason: truncated_reason.into(),
    };
    tx.send(Message::Close(Some(frame))).map_err(|_| ())
}

/// Advisory protocol version carried in `welcome.payload.protocolVersion`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default loopback port; overridable via `BROWSER_MCP_PORT`.
pub const DEFAULT_PORT: u16 = 9876;

/// WebSocket close code sent to a second agent while one is already bound.
pub const CLOSE_AGENT_ALREADY_CONNECTED: u16 = 4000;

/// WebSocket close code for protocol violations (policy violation).
pub const CLOSE_PROTOCOL_ERROR: u16 = 1008;

/// WebSocket close code used on daemon shutdown (going away).
pub const CLOSE_GOING_AWAY: u16 = 1001;

// Stable error codes surfaced to clients.
pub const ERROR_AGENT_NOT_CONNECTED: &str = "AGENT_NOT_CONNECTED";
pub const ERROR_WINDOW_CREATION_FAILED: &str = "WINDOW_CREATION_FAILED";
pub const ERROR_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
pub const ERROR_AGENT_DISCONNECTED: &str = "AGENT_DISCONNECTED";
pub const ERROR_CLIENT_DISCONNECTED: &str = "CLIENT_DISCONNECTED";
pub const ERROR_SESSION_NOT_FOUND: &str = "SESSION_NOT_FOUND";
pub const ERROR_PROTOCOL: &str = "PROTOCOL_ERROR";
pub const ERROR_COMMAND_FAILED: &str = "COMMAND_FAILED";

/// A failure with a stable code and a human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorShape {
    pub code: &'static str,
    pub message: String,
}

pub fn error_shape(code: &'static str, message: impl Into<String>) -> ErrorShape {
    ErrorShape {
        code,
        message: message.into(),
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// Inbound frames (client path)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterFrame {
    pub session_id: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFrame {
    pub req_id: String,
    pub session_id: String,
    pub command: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdFrame {
    pub session_id: String,
}

// ---------------------------------------------------------------------------
// Inbound frames (agent path)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    #[serde(default)]
    pub profile_id: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResultFrame {
    pub req_id: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectSessionFrame {
    #[serde(default)]
    pub req_id: Option<String>,
    pub payload: SelectSessionPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectSessionPayload {
    pub tab_id: i64,
    pub session_id: String,
}

/// Extract the reqId from an agent `error` frame, if present.
pub fn error_req_id(value: &Value) -> Option<&str> {
    value.get("reqId").and_then(Value::as_str)
}

/// Extract `{code?, message}` from an agent `error` frame. The agent places
/// them inside `payload`; a bare top-level `message` is tolerated.
pub fn error_payload(value: &Value) -> (Option<String>, String) {
    let payload = value.get("payload").unwrap_or(value);
    let code = payload
        .get("code")
        .and_then(Value::as_str)
        .map(str::to_string);
    let message = payload
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("agent reported an error")
        .to_string();
    (code, message)
}

/// Extract the tab id from a `tab_closed` frame. Some agent code paths put
/// `tabId` at the top level and others inside `payload`; both are accepted.
pub fn tab_closed_tab_id(value: &Value) -> Option<i64> {
    value
        .get("tabId")
        .or_else(|| value.get("payload").and_then(|p| p.get("tabId")))
        .and_then(Value::as_i64)
}

/// Extract the session id from a `window_closed` frame, accepting both the
/// `payload.sessionId` and top-level `sessionId` positions.
pub fn window_closed_session_id(value: &Value) -> Option<&str> {
    value
        .get("payload")
        .and_then(|p| p.get("sessionId"))
        .or_else(|| value.get("sessionId"))
        .and_then(Value::as_str)
}

// ---------------------------------------------------------------------------
// Outbound frames (daemon -> client)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub session_id: &'a str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl<'a> RegisteredFrame<'a> {
    pub fn ok(session_id: &'a str) -> Self {
        Self {
            frame_type: "registered",
            session_id,
            success: true,
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub req_id: &'a str,
    pub session_id: &'a str,
    pub payload: Value,
}

impl<'a> ResponseFrame<'a> {
    pub fn new(req_id: &'a str, session_id: &'a str, payload: Value) -> Self {
        Self {
            frame_type: "response",
            req_id,
            session_id,
            payload,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
    pub code: &'static str,
    pub message: String,
}

impl<'a> ErrorFrame<'a> {
    pub fn new(req_id: Option<&'a str>, session_id: Option<&'a str>, error: ErrorShape) -> Self {
        Self {
            frame_type: "error",
            req_id,
            session_id,
            code: error.code,
            message: error.message,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub agent_connected: bool,
    pub session_count: usize,
}

impl StatusFrame {
    pub fn new(agent_connected: bool, session_count: usize) -> Self {
        Self {
            frame_type: "status",
            agent_connected,
            session_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound frames (daemon -> agent)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct WelcomeFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub payload: WelcomePayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomePayload {
    pub server_id: String,
    pub protocol_version: u32,
    pub sessions: Value,
}

impl WelcomeFrame {
    pub fn new(server_id: String, sessions: Value) -> Self {
        Self {
            frame_type: "welcome",
            payload: WelcomePayload {
                server_id,
                protocol_version: PROTOCOL_VERSION,
                sessions,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionsFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub payload: SessionsPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsPayload {
    pub sessions: Value,
    pub tab_routing: Value,
}

impl SessionsFrame {
    pub fn new(sessions: Value, tab_routing: Value) -> Self {
        Self {
            frame_type: "sessions",
            payload: SessionsPayload {
                sessions,
                tab_routing,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    pub req_id: &'a str,
    pub session_id: &'a str,
    pub payload: RoutePayload<'a>,
}

#[derive(Debug, Serialize)]
pub struct RoutePayload<'a> {
    pub command: &'a str,
    pub params: Value,
}

impl<'a> RouteFrame<'a> {
    pub fn new(req_id: &'a str, session_id: &'a str, command: &'a str, params: Value) -> Self {
        Self {
            frame_type: "route",
            req_id,
            session_id,
            payload: RoutePayload { command, params },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PingFrame {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
}

impl PingFrame {
    pub fn new() -> Self {
        Self { frame_type: "ping" }
    }
}

impl Default for PingFrame {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSelectedFrame<'a> {
    #[serde(rename = "type")]
    pub frame_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<&'a str>,
    pub payload: SessionSelectedPayload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSelectedPayload<'a> {
    pub tab_id: i64,
    pub session_id: &'a str,
    pub success: bool,
}

impl<'a> SessionSelectedFrame<'a> {
    pub fn new(req_id: Option<&'a str>, tab_id: i64, session_id: &'a str, success: bool) -> Self {
        Self {
            frame_type: "session_selected",
            req_id,
            payload: SessionSelectedPayload {
                tab_id,
                session_id,
                success,
            },
        }
    }
}
