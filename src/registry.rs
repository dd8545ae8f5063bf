//! In-memory session registry.
//!
//! Tracks client sessions, the tab-routing map, and the window cache behind
//! one lock (owned by [`crate::daemon::Daemon`]) so cross-structure
//! operations like agent-reconnect invalidation stay atomic. The registry
//! holds no network state beyond each session's outbound send handle.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::{json, Value};

use crate::protocol::OutboundTx;

/// One registered client identity.
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub session_id: String,
    pub label: String,
    /// Connection that registered the session; used to decide whether a
    /// closing connection tears the session down.
    pub conn_id: String,
    pub tx: OutboundTx,
    /// Window bound to this session, valid only for the current agent
    /// connection.
    pub window_id: Option<i64>,
    pub registered_at_ms: u64,
    pub last_seen_ms: u64,
}

/// Serialisable per-session view used by broadcasts and the HTTP snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub label: String,
    pub window_id: Option<i64>,
    pub last_seen: u64,
    pub status: &'static str,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, ClientSession>,
    /// tabId -> sessionId pins for manual routing.
    tab_routes: HashMap<i64, String>,
    /// Sessions whose window was created in the current agent lifetime.
    window_cache: HashSet<String>,
}

impl SessionRegistry {
    /// Insert a session, returning the session it superseded (same id), if
    /// any. The caller rejects the superseded session's pending requests.
    pub fn insert(&mut self, session: ClientSession) -> Option<ClientSession> {
        let session_id = session.session_id.clone();
        let replaced = self.sessions.insert(session_id.clone(), session);
        if replaced.is_some() {
            // A superseded registration loses its window binding and pins.
            self.window_cache.remove(&session_id);
            self.tab_routes.retain(|_, sid| *sid != session_id);
        }
        replaced
    }

    /// Remove a session, purging its tab routes and window-cache entry.
    pub fn remove(&mut self, session_id: &str) -> Option<ClientSession> {
        let removed = self.sessions.remove(session_id)?;
        self.window_cache.remove(session_id);
        self.tab_routes.retain(|_, sid| sid != session_id);
        Some(removed)
    }

    pub fn get(&self, session_id: &str) -> Option<&ClientSession> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Update `last_seen`. Missing sessions are ignored.
    pub fn touch(&mut self, session_id: &str, now_ms: u64) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_seen_ms = now_ms;
        }
    }

    /// Record a successfully created window for a session.
    pub fn set_window(&mut self, session_id: &str, window_id: i64) {
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.window_id = Some(window_id);
            self.window_cache.insert(session_id.to_string());
        }
    }

    /// Drop a session's window binding (agent reported `window_closed`).
    /// Returns true if the session existed.
    pub fn clear_window(&mut self, session_id: &str) -> bool {
        self.window_cache.remove(session_id);
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.window_id = None;
                true
            }
            None => false,
        }
    }

    pub fn window_cached(&self, session_id: &str) -> bool {
        self.window_cache.contains(session_id)
    }

    /// Agent (re)connected: windows from the previous browser process no
    /// longer exist. Clears every binding, the cache, and all tab routes.
    pub fn clear_all_window_ids(&mut self) {
        for session in self.sessions.values_mut() {
            session.window_id = None;
        }
        self.window_cache.clear();
        self.tab_routes.clear();
    }

    /// Pin a tab to a session. The session must exist.
    pub fn set_tab_route(&mut self, tab_id: i64, session_id: &str) -> bool {
        if !self.sessions.contains_key(session_id) {
            return false;
        }
        self.tab_routes.insert(tab_id, session_id.to_string());
        true
    }

    /// Remove a tab pin (agent reported `tab_closed`). Returns true if a
    /// route existed.
    pub fn remove_tab_route(&mut self, tab_id: i64) -> bool {
        self.tab_routes.remove(&tab_id).is_some()
    }

    /// Sessions whose `last_seen` is older than the keepalive timeout.
    pub fn collect_stale(&self, now_ms: u64, keepalive_timeout_ms: u64) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| now_ms.saturating_sub(s.last_seen_ms) > keepalive_timeout_ms)
            .map(|s| s.session_id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .sessions
            .values()
            .map(|s| SessionSnapshot {
                session_id: s.session_id.clone(),
                label: s.label.clone(),
                window_id: s.window_id,
                last_seen: s.last_seen_ms,
                status: if s.window_id.is_some() {
                    "ready"
                } else {
                    "pending"
                },
            })
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn snapshot_value(&self) -> Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|_| json!([]))
    }

    /// Tab-routing map as a JSON object (`tabId` stringified for JSON keys).
    pub fn tab_routing_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        for (tab_id, session_id) in &self.tab_routes {
            map.insert(tab_id.to_string(), json!(session_id));
        }
        Value::Object(map)
    }

    /// Outbound handles of all registered client sessions.
    pub fn client_txs(&self) -> Vec<OutboundTx> {
        self.sessions.values().map(|s| s.tx.clone()).collect()
    }
}
