//! WebSocket transport.
//!
//! Every connection is untyped until its first message: `hello` selects the
//! agent path, `register`/`command`/`keepalive`/`unregister` the client
//! path, anything else is a protocol error. Outbound writes go through a
//! per-connection unbounded queue drained by a dedicated send task so
//! interleaved frames cannot corrupt each other. Per-connection failures
//! never terminate the daemon.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::daemon::Daemon;
use crate::protocol::{
    error_payload, error_req_id, error_shape, send_close, send_json, tab_closed_tab_id,
    window_closed_session_id, CommandFrame, ErrorFrame, HelloPayload, OutboundTx, PingFrame,
    RegisterFrame, RegisteredFrame, ResponseFrame, RouteResultFrame, SelectSessionFrame,
    SessionIdFrame, SessionSelectedFrame, CLOSE_AGENT_ALREADY_CONNECTED, CLOSE_PROTOCOL_ERROR,
    ERROR_PROTOCOL, ERROR_SESSION_NOT_FOUND,
};
use crate::router::RouteOutcome;

const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const MAX_PAYLOAD_BYTES: usize = 512 * 1024;

pub async fn ws_handler(ws: WebSocketUpgrade, State(daemon): State<Arc<Daemon>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, daemon))
        .into_response()
}

async fn handle_socket(socket: WebSocket, daemon: Arc<Daemon>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    run_connection(&mut receiver, &tx, &daemon).await;

    drop(tx);
    let _ = send_task.await;
}

/// Read the first message and hand the connection to the matching role path.
async fn run_connection(
    receiver: &mut SplitStream<WebSocket>,
    tx: &OutboundTx,
    daemon: &Arc<Daemon>,
) {
    let first = match recv_text_with_timeout(receiver, HANDSHAKE_TIMEOUT_MS).await {
        Ok(Some(text)) => text,
        Ok(None) => return,
        Err(reason) => {
            let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, reason);
            return;
        }
    };
    let value: Value = match serde_json::from_str(&first) {
        Ok(value) => value,
        Err(_) => {
            let _ = send_json(
                tx,
                &ErrorFrame::new(None, None, error_shape(ERROR_PROTOCOL, "malformed JSON")),
            );
            let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, "malformed JSON");
            return;
        }
    };

    let conn_id = Uuid::new_v4().to_string();
    match value.get("type").and_then(Value::as_str) {
        Some("hello") => run_agent_connection(receiver, tx, daemon, &conn_id, &value).await,
        Some("register") | Some("command") | Some("keepalive") | Some("unregister") => {
            run_client_connection(receiver, tx, daemon, &conn_id, value).await;
        }
        other => {
            debug!(?other, "unrecognized first message type");
            let _ = send_json(
                tx,
                &ErrorFrame::new(
                    None,
                    None,
                    error_shape(ERROR_PROTOCOL, "unrecognized first message"),
                ),
            );
            let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, "protocol error");
        }
    }
}

// ---------------------------------------------------------------------------
// Agent path
// ---------------------------------------------------------------------------

async fn run_agent_connection(
    receiver: &mut SplitStream<WebSocket>,
    tx: &OutboundTx,
    daemon: &Arc<Daemon>,
    conn_id: &str,
    hello: &Value,
) {
    let payload = hello
        .get("payload")
        .cloned()
        .and_then(|p| serde_json::from_value::<HelloPayload>(p).ok())
        .unwrap_or_default();

    if daemon.bind_agent(conn_id, tx.clone(), payload).is_err() {
        warn!("rejecting second agent connection");
        let _ = send_close(tx, CLOSE_AGENT_ALREADY_CONNECTED, "agent already connected");
        return;
    }

    let ping_task = spawn_agent_ping(tx.clone(), daemon.config().agent_ping_interval);
    agent_message_loop(receiver, tx, daemon).await;
    ping_task.abort();

    daemon.unbind_agent(conn_id);
}

/// Periodic `ping` keeping the agent's service-worker runtime from idling
/// out. A failed send only ends the ticker; the transport's close event is
/// authoritative for the connection itself.
fn spawn_agent_ping(tx: OutboundTx, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            if send_json(&tx, &PingFrame::new()).is_err() {
                break;
            }
        }
    })
}

async fn agent_message_loop(
    receiver: &mut SplitStream<WebSocket>,
    tx: &OutboundTx,
    daemon: &Arc<Daemon>,
) {
    while let Some(next) = receiver.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let value = match decode_inbound_message(msg, tx) {
            Ok(value) => value,
            Err(LoopSignal::Continue) => continue,
            Err(LoopSignal::Break) => break,
        };
        handle_agent_frame(daemon, tx, &value);
    }
}

fn handle_agent_frame(daemon: &Arc<Daemon>, tx: &OutboundTx, value: &Value) {
    match value.get("type").and_then(Value::as_str) {
        Some("route_result") => match serde_json::from_value::<RouteResultFrame>(value.clone()) {
            Ok(frame) => daemon.resolve_route(&frame.req_id, RouteOutcome::Reply(frame.payload)),
            Err(_) => warn!("route_result frame missing reqId"),
        },
        Some("error") => match error_req_id(value) {
            Some(req_id) => {
                let (code, message) = error_payload(value);
                daemon.resolve_route(req_id, RouteOutcome::AgentError { code, message });
            }
            None => {
                let (_, message) = error_payload(value);
                warn!(%message, "agent error without reqId");
            }
        },
        Some("keepalive") => {} // liveness reply to our ping
        Some("tab_closed") => match tab_closed_tab_id(value) {
            Some(tab_id) => daemon.handle_tab_closed(tab_id),
            None => warn!("tab_closed frame missing tabId"),
        },
        Some("window_closed") => match window_closed_session_id(value) {
            Some(session_id) => daemon.handle_window_closed(session_id),
            None => warn!("window_closed frame missing sessionId"),
        },
        Some("select_session") => {
            match serde_json::from_value::<SelectSessionFrame>(value.clone()) {
                Ok(frame) => {
                    let success = daemon.select_session(
                        frame.payload.tab_id,
                        &frame.payload.session_id,
                    );
                    let ack = SessionSelectedFrame::new(
                        frame.req_id.as_deref(),
                        frame.payload.tab_id,
                        &frame.payload.session_id,
                        success,
                    );
                    let _ = send_json(tx, &ack);
                }
                Err(_) => warn!("select_session frame missing tabId/sessionId"),
            }
        }
        Some("hello") => debug!("ignoring repeated hello on bound agent connection"),
        other => debug!(?other, "ignoring unknown agent frame"),
    }
}

// ---------------------------------------------------------------------------
// Client path
// ---------------------------------------------------------------------------

async fn run_client_connection(
    receiver: &mut SplitStream<WebSocket>,
    tx: &OutboundTx,
    daemon: &Arc<Daemon>,
    conn_id: &str,
    first: Value,
) {
    // The connection is associated with the sessionId of its first message.
    let Some(bound_session) = first
        .get("sessionId")
        .and_then(Value::as_str)
        .map(str::to_string)
    else {
        let _ = send_json(
            tx,
            &ErrorFrame::new(None, None, error_shape(ERROR_PROTOCOL, "sessionId required")),
        );
        let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, "sessionId required");
        return;
    };

    daemon.touch_session(&bound_session);
    handle_client_frame(daemon, tx, conn_id, &bound_session, &first);

    while let Some(next) = receiver.next().await {
        let msg = match next {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let value = match decode_inbound_message(msg, tx) {
            Ok(value) => value,
            Err(LoopSignal::Continue) => continue,
            Err(LoopSignal::Break) => break,
        };
        daemon.touch_session(&bound_session);
        handle_client_frame(daemon, tx, conn_id, &bound_session, &value);
    }

    // A session registered over this connection does not outlive it.
    let owns_session = daemon
        .registry
        .lock()
        .get(&bound_session)
        .map(|s| s.conn_id == conn_id)
        .unwrap_or(false);
    if owns_session {
        daemon.unregister_session(&bound_session, "connection closed");
    }
}

fn handle_client_frame(
    daemon: &Arc<Daemon>,
    tx: &OutboundTx,
    conn_id: &str,
    bound_session: &str,
    value: &Value,
) {
    match value.get("type").and_then(Value::as_str) {
        Some("register") => match serde_json::from_value::<RegisterFrame>(value.clone()) {
            Ok(frame) if frame.session_id == bound_session => {
                daemon.register_session(
                    &frame.session_id,
                    frame.label.as_deref().unwrap_or(""),
                    conn_id,
                    tx.clone(),
                );
                let _ = send_json(tx, &RegisteredFrame::ok(&frame.session_id));
            }
            Ok(frame) => {
                let _ = send_json(
                    tx,
                    &ErrorFrame::new(
                        None,
                        Some(&frame.session_id),
                        error_shape(ERROR_PROTOCOL, "connection already bound to another session"),
                    ),
                );
            }
            Err(_) => send_protocol_error(tx, "register frame missing sessionId"),
        },
        Some("command") => match serde_json::from_value::<CommandFrame>(value.clone()) {
            Ok(frame) => handle_client_command(daemon, tx, bound_session, frame),
            Err(_) => send_protocol_error(tx, "command frame missing reqId/sessionId/command"),
        },
        Some("keepalive") => match serde_json::from_value::<SessionIdFrame>(value.clone()) {
            Ok(frame) if frame.session_id == bound_session => {
                daemon.touch_session(&frame.session_id);
            }
            Ok(frame) => {
                let _ = send_json(
                    tx,
                    &ErrorFrame::new(
                        None,
                        Some(&frame.session_id),
                        error_shape(ERROR_PROTOCOL, "connection already bound to another session"),
                    ),
                );
            }
            Err(_) => send_protocol_error(tx, "keepalive frame missing sessionId"),
        },
        Some("unregister") => match serde_json::from_value::<SessionIdFrame>(value.clone()) {
            Ok(frame) if frame.session_id == bound_session => {
                daemon.unregister_session(&frame.session_id, "client unregistered");
            }
            Ok(frame) => {
                let _ = send_json(
                    tx,
                    &ErrorFrame::new(
                        None,
                        Some(&frame.session_id),
                        error_shape(ERROR_PROTOCOL, "connection already bound to another session"),
                    ),
                );
            }
            Err(_) => send_protocol_error(tx, "unregister frame missing sessionId"),
        },
        other => {
            debug!(?other, "unknown client frame type");
            send_protocol_error(tx, "unknown message type");
        }
    }
}

/// Run the dispatch in its own task so a slow command does not block this
/// client's next message; replies carry the client's reqId, so interleaved
/// completion is fine.
fn handle_client_command(
    daemon: &Arc<Daemon>,
    tx: &OutboundTx,
    bound_session: &str,
    frame: CommandFrame,
) {
    if frame.session_id != bound_session {
        let _ = send_json(
            tx,
            &ErrorFrame::new(
                Some(&frame.req_id),
                Some(&frame.session_id),
                error_shape(
                    ERROR_SESSION_NOT_FOUND,
                    "session is not registered on this connection",
                ),
            ),
        );
        return;
    }

    let daemon = Arc::clone(daemon);
    let tx = tx.clone();
    tokio::spawn(async move {
        match daemon
            .dispatch(&frame.session_id, &frame.command, frame.params)
            .await
        {
            Ok(payload) => {
                let _ = send_json(
                    &tx,
                    &ResponseFrame::new(&frame.req_id, &frame.session_id, payload),
                );
            }
            Err(err) => {
                let _ = send_json(
                    &tx,
                    &ErrorFrame::new(Some(&frame.req_id), Some(&frame.session_id), err),
                );
            }
        }
    });
}

fn send_protocol_error(tx: &OutboundTx, message: &str) {
    let _ = send_json(
        tx,
        &ErrorFrame::new(None, None, error_shape(ERROR_PROTOCOL, message)),
    );
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// Signal used to communicate loop control flow from helper functions.
enum LoopSignal {
    Continue,
    Break,
}

enum InboundText {
    Text(String),
    Control,
    Close,
}

fn message_to_text(msg: Message) -> Result<InboundText, &'static str> {
    match msg {
        Message::Text(text) => Ok(InboundText::Text(text.to_string())),
        Message::Binary(_) => Err("binary messages not supported"),
        Message::Close(_) => Ok(InboundText::Close),
        Message::Ping(_) | Message::Pong(_) => Ok(InboundText::Control),
    }
}

/// Decode a raw WebSocket message into a JSON value. Malformed JSON is a
/// protocol error and closes the connection.
fn decode_inbound_message(msg: Message, tx: &OutboundTx) -> Result<Value, LoopSignal> {
    let text = match message_to_text(msg) {
        Ok(InboundText::Text(text)) => text,
        Ok(InboundText::Control) => return Err(LoopSignal::Continue),
        Ok(InboundText::Close) => return Err(LoopSignal::Break),
        Err(reason) => {
            let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, reason);
            return Err(LoopSignal::Break);
        }
    };
    if text.len() > MAX_PAYLOAD_BYTES {
        let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, "payload too large");
        return Err(LoopSignal::Break);
    }
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => Ok(value),
        Err(_) => {
            let _ = send_json(
                tx,
                &ErrorFrame::new(None, None, error_shape(ERROR_PROTOCOL, "malformed JSON")),
            );
            let _ = send_close(tx, CLOSE_PROTOCOL_ERROR, "malformed JSON");
            Err(LoopSignal::Break)
        }
    }
}

async fn recv_text_with_timeout(
    receiver: &mut SplitStream<WebSocket>,
    timeout_ms: u64,
) -> Result<Option<String>, &'static str> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err("handshake timeout");
        }
        let msg = match tokio::time::timeout(remaining, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(_))) => return Err("socket error"),
            Ok(None) => return Ok(None),
            Err(_) => return Err("handshake timeout"),
        };
        match message_to_text(msg) {
            Ok(InboundText::Text(text)) => return Ok(Some(text)),
            Ok(InboundText::Control) => continue,
            Ok(InboundText::Close) => return Ok(None),
            Err(reason) => return Err(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_to_text() {
        match message_to_text(Message::Text("hi".into())).unwrap() {
            InboundText::Text(text) => assert_eq!(text, "hi"),
            _ => panic!("expected text"),
        }
        assert!(matches!(
            message_to_text(Message::Ping(vec![].into())).unwrap(),
            InboundText::Control
        ));
        assert!(matches!(
            message_to_text(Message::Close(None)).unwrap(),
            InboundText::Close
        ));
        assert!(message_to_text(Message::Binary(vec![1].into())).is_err());
    }
}
