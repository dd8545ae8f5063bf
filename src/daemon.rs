//! The daemon value that owns all shared state.
//!
//! One [`Daemon`] is constructed per process and passed to every handler;
//! there are no module-level mutable singletons. It owns the session
//! registry and the router state behind `parking_lot` mutexes. Lock order is
//! router before registry when both are needed; no lock is ever held across
//! an `.await` — the pending-request oneshot is the rendezvous.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::protocol::{
    error_shape, now_ms, send_close, send_json, send_text, ErrorShape, HelloPayload, OutboundTx,
    RouteFrame, SessionsFrame, StatusFrame, WelcomeFrame, CLOSE_GOING_AWAY,
    ERROR_AGENT_DISCONNECTED, ERROR_AGENT_NOT_CONNECTED, ERROR_CLIENT_DISCONNECTED,
    ERROR_COMMAND_FAILED, ERROR_PROTOCOL, ERROR_REQUEST_TIMEOUT, ERROR_SESSION_NOT_FOUND,
    ERROR_WINDOW_CREATION_FAILED, PROTOCOL_VERSION,
};
use crate::registry::{ClientSession, SessionRegistry};
use crate::router::{AgentHandle, PendingRequest, RouteOutcome, RouterState};

pub struct Daemon {
    config: DaemonConfig,
    start_time: Instant,
    server_id: String,
    pub registry: Mutex<SessionRegistry>,
    pub router: Mutex<RouterState>,
    /// Wakes dispatch tasks parked on agent attachment.
    agent_bound: Notify,
    /// Bumped when a dispatch finds no agent; the external collaborator
    /// responsible for starting the browser can watch this.
    launch_tx: watch::Sender<u64>,
}

impl Daemon {
    pub fn new(config: DaemonConfig) -> Self {
        let server_id = Uuid::new_v4().to_string();
        let boot_nonce = server_id
            .split('-')
            .next()
            .unwrap_or("boot")
            .to_string();
        let (launch_tx, _) = watch::channel(0);
        Self {
            config,
            start_time: Instant::now(),
            server_id,
            registry: Mutex::new(SessionRegistry::default()),
            router: Mutex::new(RouterState::new(boot_nonce)),
            agent_bound: Notify::new(),
            launch_tx,
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn agent_connected(&self) -> bool {
        self.router.lock().agent_connected()
    }

    /// Subscribe to browser-launch requests (the counter bumps each time a
    /// dispatch waits for an absent agent).
    pub fn launch_requests(&self) -> watch::Receiver<u64> {
        self.launch_tx.subscribe()
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Create (or supersede) a client session and broadcast the change.
    pub fn register_session(&self, session_id: &str, label: &str, conn_id: &str, tx: OutboundTx) {
        let now = now_ms();
        let session = ClientSession {
            session_id: session_id.to_string(),
            label: label.to_string(),
            conn_id: conn_id.to_string(),
            tx,
            window_id: None,
            registered_at_ms: now,
            last_seen_ms: now,
        };
        let replaced = self.registry.lock().insert(session);
        if replaced.is_some() {
            warn!(session_id, "session re-registered; superseding previous registration");
            self.router.lock().reject_session(
                session_id,
                ERROR_CLIENT_DISCONNECTED,
                "session re-registered",
            );
        }
        info!(session_id, label, "session registered");
        self.broadcast_sessions();
    }

    /// Tear a session down: close its window (fire-and-forget), purge its
    /// tab routes, reject its pending requests, and rebroadcast.
    pub fn unregister_session(self: &Arc<Self>, session_id: &str, reason: &str) {
        let removed = match self.registry.lock().remove(session_id) {
            Some(removed) => removed,
            None => return,
        };
        info!(session_id, reason, "session unregistered");

        if let Some(window_id) = removed.window_id {
            let daemon = Arc::clone(self);
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                // Errors are swallowed: the session is gone either way.
                if let Err(e) = daemon
                    .agent_request(
                        &session_id,
                        "close_window",
                        json!({ "sessionId": session_id, "windowId": window_id }),
                    )
                    .await
                {
                    debug!(%session_id, code = e.code, "close_window after unregister failed");
                }
            });
        }

        self.router
            .lock()
            .reject_session(session_id, ERROR_CLIENT_DISCONNECTED, reason);
        self.broadcast_sessions();
    }

    /// Update a session's liveness clock. Runs on every inbound client
    /// message; missing sessions are ignored.
    pub fn touch_session(&self, session_id: &str) {
        self.registry.lock().touch(session_id, now_ms());
    }

    /// Unregister every session whose last keepalive is older than the
    /// keepalive timeout. Running it twice back-to-back is a no-op.
    pub fn sweep_stale(self: &Arc<Self>) {
        let timeout_ms = self.config.keepalive_timeout.as_millis() as u64;
        let stale = self.registry.lock().collect_stale(now_ms(), timeout_ms);
        for session_id in stale {
            info!(%session_id, "sweeping stale session");
            self.unregister_session(&session_id, "keepalive timeout");
        }
    }

    // -----------------------------------------------------------------------
    // Agent lifecycle
    // -----------------------------------------------------------------------

    /// Bind an agent connection. On success the `welcome` and an initial
    /// `sessions` broadcast are queued on the agent's outbound channel
    /// before any parked dispatch is woken, so they precede the next
    /// forwarded command. Fails when a different connection already holds
    /// the slot.
    pub fn bind_agent(
        &self,
        conn_id: &str,
        tx: OutboundTx,
        hello: HelloPayload,
    ) -> Result<(), ErrorShape> {
        {
            let mut router = self.router.lock();
            let handle = AgentHandle {
                conn_id: conn_id.to_string(),
                tx: tx.clone(),
                profile_id: hello.profile_id,
                capabilities: hello.capabilities,
                connected_at_ms: now_ms(),
            };
            if router.bind_agent(handle).is_err() {
                return Err(error_shape(ERROR_PROTOCOL, "agent already connected"));
            }

            let mut registry = self.registry.lock();
            registry.clear_all_window_ids();
            let sessions = registry.snapshot_value();
            let tab_routing = registry.tab_routing_value();
            drop(registry);

            let welcome = WelcomeFrame::new(self.server_id.clone(), sessions.clone());
            let _ = send_json(&tx, &welcome);
            let _ = send_json(&tx, &SessionsFrame::new(sessions, tab_routing));
        }
        info!(conn_id, "agent connected");
        self.agent_bound.notify_waiters();
        self.push_status();
        Ok(())
    }

    /// Release the agent slot if `conn_id` holds it. Every pending request
    /// is rejected under the same lock, before any new agent can bind.
    pub fn unbind_agent(&self, conn_id: &str) -> bool {
        {
            let mut router = self.router.lock();
            if router.take_agent_if(conn_id).is_none() {
                return false;
            }
            router.reject_all(ERROR_AGENT_DISCONNECTED, "agent disconnected");
            self.registry.lock().clear_all_window_ids();
        }
        info!(conn_id, "agent disconnected");
        self.push_status();
        true
    }

    // -----------------------------------------------------------------------
    // Dispatch (the router's single public verb)
    // -----------------------------------------------------------------------

    /// Deliver `command` for `session_id` and return its terminal outcome.
    pub async fn dispatch(
        &self,
        session_id: &str,
        command: &str,
        params: Option<Value>,
    ) -> Result<Value, ErrorShape> {
        if !self.registry.lock().contains(session_id) {
            return Err(error_shape(
                ERROR_SESSION_NOT_FOUND,
                format!("unknown session {session_id}"),
            ));
        }
        let params = inject_session_id(params, session_id)?;

        self.wait_for_agent().await?;
        self.ensure_window(session_id).await?;
        self.agent_request(session_id, command, params).await
    }

    /// Wait for an agent to attach, signalling the browser launcher once.
    async fn wait_for_agent(&self) -> Result<(), ErrorShape> {
        let deadline = Instant::now() + self.config.agent_connect_timeout;
        let mut requested_launch = false;
        loop {
            // Register interest before checking so a bind between the check
            // and the await cannot be missed.
            let notified = self.agent_bound.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.router.lock().agent_connected() {
                return Ok(());
            }
            if !requested_launch {
                self.launch_tx.send_modify(|n| *n += 1);
                requested_launch = true;
                info!("no agent connected; requested browser launch");
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, notified).await.is_err()
            {
                return Err(error_shape(
                    ERROR_AGENT_NOT_CONNECTED,
                    "no browser agent connected",
                ));
            }
        }
    }

    /// Lazily create the session's window in the current agent lifetime.
    async fn ensure_window(&self, session_id: &str) -> Result<(), ErrorShape> {
        if self.registry.lock().window_cached(session_id) {
            return Ok(());
        }

        let reply = self
            .agent_request(session_id, "create_window", json!({ "sessionId": session_id }))
            .await;
        let payload = match reply {
            Ok(payload) => payload,
            Err(e) if e.code == ERROR_COMMAND_FAILED => {
                return Err(error_shape(ERROR_WINDOW_CREATION_FAILED, e.message));
            }
            // Deadline or agent loss keeps its lifecycle code.
            Err(e) => return Err(e),
        };

        let Some(window_id) = payload.get("windowId").and_then(Value::as_i64) else {
            return Err(error_shape(
                ERROR_WINDOW_CREATION_FAILED,
                "create_window reply carried no windowId",
            ));
        };

        {
            let mut registry = self.registry.lock();
            if !registry.contains(session_id) {
                return Err(error_shape(
                    ERROR_SESSION_NOT_FOUND,
                    format!("session {session_id} unregistered during window creation"),
                ));
            }
            registry.set_window(session_id, window_id);
        }
        debug!(session_id, window_id, "window created");
        self.broadcast_sessions();
        Ok(())
    }

    /// Forward one request to the agent and await its terminal outcome.
    ///
    /// The pending entry is registered and the frame queued under the router
    /// lock; the await happens lock-free on the oneshot.
    pub async fn agent_request(
        &self,
        session_id: &str,
        command: &str,
        params: Value,
    ) -> Result<Value, ErrorShape> {
        let (req_id, receiver) = {
            let mut router = self.router.lock();
            let Some(tx) = router.agent_tx() else {
                return Err(error_shape(
                    ERROR_AGENT_NOT_CONNECTED,
                    "no browser agent connected",
                ));
            };
            let req_id = router.allocate_req_id();
            let (responder, receiver) = oneshot::channel();
            router.insert_pending(
                req_id.clone(),
                PendingRequest {
                    session_id: session_id.to_string(),
                    responder,
                },
            );
            let frame = RouteFrame::new(&req_id, session_id, command, params);
            if send_json(&tx, &frame).is_err() {
                router.remove_pending(&req_id);
                return Err(error_shape(
                    ERROR_AGENT_DISCONNECTED,
                    "agent connection lost",
                ));
            }
            (req_id, receiver)
        };

        match tokio::time::timeout(self.config.request_timeout, receiver).await {
            Ok(Ok(RouteOutcome::Reply(payload))) => Ok(payload),
            Ok(Ok(RouteOutcome::AgentError { code, message })) => {
                let message = match code {
                    Some(code) => format!("{code}: {message}"),
                    None => message,
                };
                Err(error_shape(ERROR_COMMAND_FAILED, message))
            }
            Ok(Ok(RouteOutcome::Rejected { code, message })) => Err(ErrorShape { code, message }),
            Ok(Err(_)) => Err(error_shape(
                ERROR_AGENT_DISCONNECTED,
                "agent connection lost",
            )),
            Err(_) => {
                // Remove the entry so a late reply is dropped, not delivered.
                self.router.lock().remove_pending(&req_id);
                Err(error_shape(
                    ERROR_REQUEST_TIMEOUT,
                    format!("no reply for {command} within {:?}", self.config.request_timeout),
                ))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Agent-initiated events
    // -----------------------------------------------------------------------

    /// Correlate an inbound `route_result`/`error` with its pending request.
    /// Unknown reqIds are logged and dropped.
    pub fn resolve_route(&self, req_id: &str, outcome: RouteOutcome) {
        if !self.router.lock().resolve(req_id, outcome) {
            debug!(req_id, "dropping reply with unknown reqId");
        }
    }

    pub fn handle_tab_closed(&self, tab_id: i64) {
        if self.registry.lock().remove_tab_route(tab_id) {
            debug!(tab_id, "tab route removed");
            self.broadcast_sessions();
        }
    }

    pub fn handle_window_closed(&self, session_id: &str) {
        if self.registry.lock().clear_window(session_id) {
            debug!(session_id, "window binding cleared");
            self.broadcast_sessions();
        }
    }

    /// Pin a tab to a session (manual routing). Returns whether the pin was
    /// recorded; unknown sessions are a hard no.
    pub fn select_session(&self, tab_id: i64, session_id: &str) -> bool {
        let pinned = self.registry.lock().set_tab_route(tab_id, session_id);
        if pinned {
            self.broadcast_sessions();
        }
        pinned
    }

    // -----------------------------------------------------------------------
    // Broadcasts and snapshots
    // -----------------------------------------------------------------------

    /// Push the current session list and tab routing to the agent.
    pub fn broadcast_sessions(&self) {
        let (sessions, tab_routing) = {
            let registry = self.registry.lock();
            (registry.snapshot_value(), registry.tab_routing_value())
        };
        let Some(tx) = self.router.lock().agent_tx() else {
            return;
        };
        let _ = send_json(&tx, &SessionsFrame::new(sessions, tab_routing));
    }

    /// Push a `status` frame to every client.
    pub fn push_status(&self) {
        let agent_connected = self.router.lock().agent_connected();
        let (txs, count) = {
            let registry = self.registry.lock();
            (registry.client_txs(), registry.len())
        };
        let frame = StatusFrame::new(agent_connected, count);
        let serialized = match serde_json::to_string(&frame) {
            Ok(s) => s,
            Err(_) => return,
        };
        for tx in txs {
            let _ = send_text(&tx, serialized.clone());
        }
    }

    /// JSON health snapshot served over HTTP.
    pub fn health_snapshot(&self) -> Value {
        let sessions = self.registry.lock().snapshot_value();
        let client_count = self.registry.lock().len();
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "protocolVersion": PROTOCOL_VERSION,
            "agentConnected": self.agent_connected(),
            "clientCount": client_count,
            "uptimeMs": self.uptime_ms(),
            "sessions": sessions,
        })
    }

    /// Daemon shutdown: reject everything in flight and close every
    /// connection with a normal close code.
    pub fn shutdown(&self) {
        info!("daemon shutting down");
        let agent = {
            let mut router = self.router.lock();
            router.reject_all(ERROR_AGENT_DISCONNECTED, "daemon shutting down");
            router.take_agent_if_any()
        };
        if let Some(agent) = agent {
            let _ = send_close(&agent.tx, CLOSE_GOING_AWAY, "daemon shutting down");
        }
        let txs = self.registry.lock().client_txs();
        for tx in txs {
            let _ = send_close(&tx, CLOSE_GOING_AWAY, "daemon shutting down");
        }
    }
}

/// Scope `params` to the session before forwarding: the agent uses the
/// injected `sessionId` for tab/window lookups.
fn inject_session_id(params: Option<Value>, session_id: &str) -> Result<Value, ErrorShape> {
    match params {
        None | Some(Value::Null) => Ok(json!({ "sessionId": session_id })),
        Some(Value::Object(mut map)) => {
            map.insert("sessionId".to_string(), json!(session_id));
            Ok(Value::Object(map))
        }
        Some(_) => Err(error_shape(ERROR_PROTOCOL, "params must be an object")),
    }
}
