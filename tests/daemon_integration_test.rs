//! Integration tests for the multiplex daemon.
//!
//! Each test spins up a real daemon on an ephemeral port via
//! [`run_server_with_config`], talks to it over actual sockets (reqwest for
//! HTTP, tokio-tungstenite for the WS channel), and shuts it down cleanly.
//! A scripted in-test agent stands in for the browser extension and answers
//! `create_window`/`get_tabs`/`navigate` deterministically so assertions on
//! window isolation are exact.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use helm::config::DaemonConfig;
use helm::daemon::Daemon;
use helm::server::startup::{run_server_with_config, ServerConfig, ServerHandle};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn test_config() -> DaemonConfig {
    DaemonConfig {
        request_timeout: Duration::from_secs(5),
        agent_connect_timeout: Duration::from_millis(500),
        ..DaemonConfig::default()
    }
}

async fn start_server(config: DaemonConfig, background_tasks: bool) -> ServerHandle {
    let daemon = Arc::new(Daemon::new(config));
    let server_config = ServerConfig {
        spawn_background_tasks: background_tasks,
        ..ServerConfig::for_testing(daemon)
    };
    run_server_with_config(server_config).await.unwrap()
}

async fn start_test_server() -> ServerHandle {
    start_server(test_config(), false).await
}

async fn connect(handle: &ServerHandle) -> WsStream {
    let (ws, _) = connect_async(handle.ws_url()).await.expect("ws connect");
    ws
}

async fn send_frame(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Receive frames until one with the given `type` arrives, skipping
/// unrelated pushes (`status`, `ping`, broadcasts). Panics after 5s.
async fn recv_frame_of_type(ws: &mut WsStream, frame_type: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        let msg = tokio::time::timeout(remaining, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {frame_type} frame"))
            .unwrap_or_else(|| panic!("stream ended waiting for {frame_type} frame"))
            .expect("ws error");
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(frame) => panic!("closed waiting for {frame_type}: {frame:?}"),
            _ => continue,
        };
        let value: Value = serde_json::from_str(&text).unwrap();
        if value["type"] == frame_type {
            return value;
        }
    }
}

/// Assert that no text frame arrives within `window`.
async fn assert_silent(ws: &mut WsStream, window: Duration) {
    let result = tokio::time::timeout(window, ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("expected silence, got frame: {text}");
    }
}

/// Wait until a close frame arrives and return its code.
async fn recv_close_code(ws: &mut WsStream) -> u16 {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline - tokio::time::Instant::now();
        match tokio::time::timeout(remaining, ws.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(Some(frame)))) => return u16::from(frame.code),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("stream ended without close frame"),
        }
    }
}

async fn register(ws: &mut WsStream, session_id: &str, label: &str) {
    send_frame(
        ws,
        json!({ "type": "register", "sessionId": session_id, "label": label }),
    )
    .await;
    let ack = recv_frame_of_type(ws, "registered").await;
    assert_eq!(ack["sessionId"], session_id);
    assert_eq!(ack["success"], true);
}

async fn fetch_health(handle: &ServerHandle) -> Value {
    reqwest::get(format!("{}/health", handle.base_url()))
        .await
        .expect("GET /health failed")
        .json()
        .await
        .unwrap()
}

async fn wait_until<F: Fn(&Value) -> bool>(handle: &ServerHandle, predicate: F, what: &str) {
    for _ in 0..100 {
        let health = fetch_health(handle).await;
        if predicate(&health) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("health never reached state: {what}");
}

// ---------------------------------------------------------------------------
// Scripted agent
// ---------------------------------------------------------------------------

/// A stand-in for the browser extension. Windows are assigned 42, 43, ... in
/// creation order; `get_tabs` answers tabs derived from the session's window
/// id so cross-session assertions are exact.
struct ScriptedAgent {
    create_window_calls: Arc<AtomicUsize>,
    routed_commands: Arc<Mutex<Vec<String>>>,
    stop_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ScriptedAgent {
    async fn attach(handle: &ServerHandle) -> Self {
        let mut ws = connect(handle).await;
        send_frame(
            &mut ws,
            json!({
                "type": "hello",
                "payload": { "profileId": "default", "capabilities": ["tabs", "windows"] }
            }),
        )
        .await;
        let welcome = recv_frame_of_type(&mut ws, "welcome").await;
        assert_eq!(welcome["payload"]["protocolVersion"], 1);

        let create_window_calls = Arc::new(AtomicUsize::new(0));
        let routed_commands = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let calls = Arc::clone(&create_window_calls);
        let commands = Arc::clone(&routed_commands);
        let task = tokio::spawn(async move {
            let mut windows: HashMap<String, i64> = HashMap::new();
            loop {
                tokio::select! {
                    _ = &mut stop_rx => {
                        let _ = ws.close(None).await;
                        break;
                    }
                    next = ws.next() => {
                        let msg = match next {
                            Some(Ok(msg)) => msg,
                            _ => break,
                        };
                        let text = match msg {
                            Message::Text(text) => text,
                            Message::Close(_) => break,
                            _ => continue,
                        };
                        let value: Value = serde_json::from_str(&text).unwrap();
                        if value["type"] != "route" {
                            continue;
                        }
                        let req_id = value["reqId"].as_str().unwrap().to_string();
                        let command = value["payload"]["command"].as_str().unwrap().to_string();
                        let params = &value["payload"]["params"];
                        let session_id = params["sessionId"].as_str().unwrap_or("").to_string();
                        commands.lock().push(command.clone());

                        let payload = match command.as_str() {
                            "create_window" => {
                                calls.fetch_add(1, Ordering::SeqCst);
                                let next_id = 42 + windows.len() as i64;
                                let window_id =
                                    *windows.entry(session_id.clone()).or_insert(next_id);
                                json!({ "windowId": window_id })
                            }
                            "get_tabs" => {
                                let window_id = windows.get(&session_id).copied().unwrap_or(-1);
                                json!({
                                    "tabs": [
                                        { "tabId": window_id * 10 + 1, "windowId": window_id },
                                        { "tabId": window_id * 10 + 2, "windowId": window_id },
                                    ]
                                })
                            }
                            "navigate" => json!({ "success": true, "url": params["url"] }),
                            "close_window" => {
                                windows.remove(&session_id);
                                json!({ "success": true })
                            }
                            _ => json!({ "success": true }),
                        };
                        let reply = json!({
                            "type": "route_result",
                            "reqId": req_id,
                            "sessionId": session_id,
                            "payload": payload,
                        });
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            create_window_calls,
            routed_commands,
            stop_tx,
            task,
        }
    }

    fn create_window_count(&self) -> usize {
        self.create_window_calls.load(Ordering::SeqCst)
    }

    fn commands(&self) -> Vec<String> {
        self.routed_commands.lock().clone()
    }

    async fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.task.await;
    }
}

// ---------------------------------------------------------------------------
// 1. Health endpoint
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint_responds() {
    let handle = start_test_server().await;

    let body = fetch_health(&handle).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["protocolVersion"], 1);
    assert_eq!(body["agentConnected"], false);
    assert_eq!(body["clientCount"], 0);
    assert_eq!(body["sessions"], json!([]));
    assert!(body.get("version").is_some());

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 2. S1 — happy path: register, attach agent, navigate
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_happy_path_command_round_trip() {
    let handle = start_test_server().await;

    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;

    let agent = ScriptedAgent::attach(&handle).await;
    wait_until(&handle, |h| h["agentConnected"] == true, "agent connected").await;

    send_frame(
        &mut client,
        json!({
            "type": "command",
            "reqId": "r1",
            "sessionId": "s1",
            "command": "navigate",
            "params": { "url": "https://example.com" }
        }),
    )
    .await;

    let response = recv_frame_of_type(&mut client, "response").await;
    assert_eq!(response["reqId"], "r1");
    assert_eq!(response["sessionId"], "s1");
    assert_eq!(response["payload"]["success"], true);
    assert_eq!(response["payload"]["url"], "https://example.com");

    // The window was created lazily, exactly once, before the command.
    assert_eq!(agent.create_window_count(), 1);
    assert_eq!(agent.commands(), vec!["create_window", "navigate"]);

    let health = fetch_health(&handle).await;
    assert_eq!(health["sessions"][0]["windowId"], 42);
    assert_eq!(health["sessions"][0]["status"], "ready");

    agent.stop().await;
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 3. S2 — request timeout, late reply dropped
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_request_timeout_and_late_reply_dropped() {
    let config = DaemonConfig {
        request_timeout: Duration::from_millis(300),
        agent_connect_timeout: Duration::from_millis(500),
        ..DaemonConfig::default()
    };
    let handle = start_server(config, false).await;

    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;

    // Hand-rolled agent: answers create_window, goes silent on navigate.
    let mut agent = connect(&handle).await;
    send_frame(&mut agent, json!({ "type": "hello", "payload": {} })).await;
    recv_frame_of_type(&mut agent, "welcome").await;

    send_frame(
        &mut client,
        json!({
            "type": "command",
            "reqId": "r1",
            "sessionId": "s1",
            "command": "navigate",
            "params": { "url": "https://example.com" }
        }),
    )
    .await;

    let create = recv_frame_of_type(&mut agent, "route").await;
    assert_eq!(create["payload"]["command"], "create_window");
    send_frame(
        &mut agent,
        json!({
            "type": "route_result",
            "reqId": create["reqId"],
            "payload": { "windowId": 42 }
        }),
    )
    .await;

    let navigate = recv_frame_of_type(&mut agent, "route").await;
    assert_eq!(navigate["payload"]["command"], "navigate");
    // ... and never reply.

    let error = recv_frame_of_type(&mut client, "error").await;
    assert_eq!(error["reqId"], "r1");
    assert_eq!(error["code"], "REQUEST_TIMEOUT");

    // A late reply for the timed-out reqId is dropped silently.
    send_frame(
        &mut agent,
        json!({
            "type": "route_result",
            "reqId": navigate["reqId"],
            "payload": { "success": true }
        }),
    )
    .await;
    assert_silent(&mut client, Duration::from_millis(300)).await;

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 4. S3 — agent reconnect invalidates window bindings
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_agent_reconnect_invalidation() {
    let handle = start_test_server().await;

    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;

    let first_agent = ScriptedAgent::attach(&handle).await;
    send_frame(
        &mut client,
        json!({
            "type": "command", "reqId": "r1", "sessionId": "s1",
            "command": "navigate", "params": { "url": "https://a" }
        }),
    )
    .await;
    recv_frame_of_type(&mut client, "response").await;
    assert_eq!(first_agent.create_window_count(), 1);

    first_agent.stop().await;
    wait_until(&handle, |h| h["agentConnected"] == false, "agent detached").await;

    // Window bindings from the dead browser process are gone.
    let health = fetch_health(&handle).await;
    assert_eq!(health["sessions"][0]["windowId"], Value::Null);
    assert_eq!(health["sessions"][0]["status"], "pending");

    let second_agent = ScriptedAgent::attach(&handle).await;
    send_frame(
        &mut client,
        json!({
            "type": "command", "reqId": "r2", "sessionId": "s1",
            "command": "navigate", "params": { "url": "https://b" }
        }),
    )
    .await;
    let response = recv_frame_of_type(&mut client, "response").await;
    assert_eq!(response["reqId"], "r2");

    // A fresh create_window round-trip preceded the forwarded command.
    assert_eq!(second_agent.create_window_count(), 1);
    assert_eq!(second_agent.commands(), vec!["create_window", "navigate"]);

    second_agent.stop().await;
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 5. S4 — duplicate agent is closed with 4000, first stays bound
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_agent_closed_with_4000() {
    let handle = start_test_server().await;

    let agent = ScriptedAgent::attach(&handle).await;

    let mut second = connect(&handle).await;
    send_frame(&mut second, json!({ "type": "hello", "payload": {} })).await;
    assert_eq!(recv_close_code(&mut second).await, 4000);

    // The first agent is unaffected: a command still round-trips.
    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;
    send_frame(
        &mut client,
        json!({
            "type": "command", "reqId": "r1", "sessionId": "s1",
            "command": "navigate", "params": { "url": "https://a" }
        }),
    )
    .await;
    let response = recv_frame_of_type(&mut client, "response").await;
    assert_eq!(response["payload"]["success"], true);

    agent.stop().await;
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 6. S5 — stale client is swept
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stale_session_is_swept() {
    let config = DaemonConfig {
        keepalive_timeout: Duration::from_millis(400),
        ..test_config()
    };
    let handle = start_server(config, true).await;

    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;
    assert_eq!(fetch_health(&handle).await["clientCount"], 1);

    // The client keeps its socket open but never sends keepalives.
    wait_until(&handle, |h| h["clientCount"] == 0, "session swept").await;

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_foreign_keepalive_cannot_keep_session_alive() {
    let config = DaemonConfig {
        keepalive_timeout: Duration::from_millis(400),
        ..test_config()
    };
    let handle = start_server(config, true).await;

    let mut c1 = connect(&handle).await;
    register(&mut c1, "s1", "first").await;
    let mut c2 = connect(&handle).await;
    register(&mut c2, "s2", "second").await;

    // c1 keepalives itself and also tries to keepalive s2; the cross-session
    // keepalive is rejected and must not refresh s2's clock. c2 stays silent.
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        send_frame(&mut c1, json!({ "type": "keepalive", "sessionId": "s1" })).await;
        send_frame(&mut c1, json!({ "type": "keepalive", "sessionId": "s2" })).await;
    }

    let err = recv_frame_of_type(&mut c1, "error").await;
    assert_eq!(err["code"], "PROTOCOL_ERROR");
    assert_eq!(err["sessionId"], "s2");

    wait_until(&handle, |h| h["clientCount"] == 1, "stale s2 swept").await;
    let health = fetch_health(&handle).await;
    assert_eq!(health["sessions"][0]["sessionId"], "s1");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keepalives_prevent_sweep() {
    let config = DaemonConfig {
        keepalive_timeout: Duration::from_millis(400),
        ..test_config()
    };
    let handle = start_server(config, true).await;

    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        send_frame(&mut client, json!({ "type": "keepalive", "sessionId": "s1" })).await;
    }
    assert_eq!(fetch_health(&handle).await["clientCount"], 1);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 7. S6 — cross-session isolation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cross_session_isolation() {
    let handle = start_test_server().await;

    let mut c1 = connect(&handle).await;
    register(&mut c1, "s1", "first").await;
    let mut c2 = connect(&handle).await;
    register(&mut c2, "s2", "second").await;

    let agent = ScriptedAgent::attach(&handle).await;

    // Sequence the first commands so window assignment is deterministic:
    // s1 -> 42, s2 -> 43.
    send_frame(
        &mut c1,
        json!({ "type": "command", "reqId": "r1", "sessionId": "s1", "command": "get_tabs" }),
    )
    .await;
    let r1 = recv_frame_of_type(&mut c1, "response").await;
    send_frame(
        &mut c2,
        json!({ "type": "command", "reqId": "r2", "sessionId": "s2", "command": "get_tabs" }),
    )
    .await;
    let r2 = recv_frame_of_type(&mut c2, "response").await;

    let tabs1 = r1["payload"]["tabs"].as_array().unwrap();
    let tabs2 = r2["payload"]["tabs"].as_array().unwrap();
    assert!(tabs1.iter().all(|t| t["windowId"] == 42));
    assert!(tabs2.iter().all(|t| t["windowId"] == 43));
    let ids1: Vec<i64> = tabs1.iter().map(|t| t["tabId"].as_i64().unwrap()).collect();
    let ids2: Vec<i64> = tabs2.iter().map(|t| t["tabId"].as_i64().unwrap()).collect();
    assert_eq!(ids1, vec![421, 422]);
    assert_eq!(ids2, vec![431, 432]);

    // A command on c1 naming s2 never reaches the agent.
    send_frame(
        &mut c1,
        json!({ "type": "command", "reqId": "r3", "sessionId": "s2", "command": "get_tabs" }),
    )
    .await;
    let err = recv_frame_of_type(&mut c1, "error").await;
    assert_eq!(err["reqId"], "r3");
    assert_eq!(err["code"], "SESSION_NOT_FOUND");
    assert_eq!(
        agent.commands(),
        vec!["create_window", "get_tabs", "create_window", "get_tabs"]
    );

    agent.stop().await;
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 8. Unregister closes the session's window
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unregister_closes_window() {
    let handle = start_test_server().await;

    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;
    let agent = ScriptedAgent::attach(&handle).await;

    send_frame(
        &mut client,
        json!({
            "type": "command", "reqId": "r1", "sessionId": "s1",
            "command": "navigate", "params": { "url": "https://a" }
        }),
    )
    .await;
    recv_frame_of_type(&mut client, "response").await;

    send_frame(&mut client, json!({ "type": "unregister", "sessionId": "s1" })).await;
    wait_until(&handle, |h| h["clientCount"] == 0, "session unregistered").await;

    // The fire-and-forget close_window reached the agent.
    for _ in 0..100 {
        if agent.commands().contains(&"close_window".to_string()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(agent.commands().contains(&"close_window".to_string()));

    agent.stop().await;
    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 9. Protocol errors
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_without_register_fails() {
    let handle = start_test_server().await;

    let mut client = connect(&handle).await;
    send_frame(
        &mut client,
        json!({ "type": "command", "reqId": "r1", "sessionId": "ghost", "command": "navigate" }),
    )
    .await;
    let err = recv_frame_of_type(&mut client, "error").await;
    assert_eq!(err["reqId"], "r1");
    assert_eq!(err["code"], "SESSION_NOT_FOUND");

    handle.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrecognized_first_message_closes_connection() {
    let handle = start_test_server().await;

    let mut ws = connect(&handle).await;
    send_frame(&mut ws, json!({ "type": "bogus" })).await;
    let err = recv_frame_of_type(&mut ws, "error").await;
    assert_eq!(err["code"], "PROTOCOL_ERROR");
    assert_eq!(recv_close_code(&mut ws).await, 1008);

    handle.shutdown().await;
}

// ---------------------------------------------------------------------------
// 10. Command without an agent fails with AGENT_NOT_CONNECTED
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_command_without_agent_fails() {
    let config = DaemonConfig {
        agent_connect_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let handle = start_server(config, false).await;

    let mut client = connect(&handle).await;
    register(&mut client, "s1", "L").await;
    send_frame(
        &mut client,
        json!({ "type": "command", "reqId": "r1", "sessionId": "s1", "command": "navigate" }),
    )
    .await;
    let err = recv_frame_of_type(&mut client, "error").await;
    assert_eq!(err["reqId"], "r1");
    assert_eq!(err["code"], "AGENT_NOT_CONNECTED");

    handle.shutdown().await;
}
