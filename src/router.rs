//! Request correlation state.
//!
//! Holds the single agent slot and the pending-request table. Each forwarded
//! command registers a oneshot responder keyed by reqId; the agent's reply
//! (or a lifecycle rejection) is delivered through it to the task awaiting
//! the outcome. Entries are append-under-lock, remove-under-lock; the await
//! itself happens with no lock held.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::OutboundTx;

/// Terminal outcome of one routed request.
#[derive(Debug)]
pub enum RouteOutcome {
    /// `route_result` arrived for this reqId.
    Reply(Value),
    /// The agent answered with an `error` frame for this reqId.
    AgentError {
        code: Option<String>,
        message: String,
    },
    /// The daemon rejected the request (disconnect fan-out, shutdown).
    Rejected {
        code: &'static str,
        message: String,
    },
}

#[derive(Debug)]
pub struct PendingRequest {
    pub session_id: String,
    pub responder: oneshot::Sender<RouteOutcome>,
}

/// The one live agent connection.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    pub conn_id: String,
    pub tx: OutboundTx,
    pub profile_id: Option<String>,
    pub capabilities: Vec<String>,
    pub connected_at_ms: u64,
}

#[derive(Debug)]
pub struct RouterState {
    agent: Option<AgentHandle>,
    pending: HashMap<String, PendingRequest>,
    /// Monotonic counter prefixed with a per-boot nonce so replies from a
    /// previous daemon life cannot collide.
    boot_nonce: String,
    next_req: u64,
}

impl RouterState {
    pub fn new(boot_nonce: String) -> Self {
        Self {
            agent: None,
            pending: HashMap::new(),
            boot_nonce,
            next_req: 0,
        }
    }

    pub fn agent(&self) -> Option<&AgentHandle> {
        self.agent.as_ref()
    }

    pub fn agent_tx(&self) -> Option<OutboundTx> {
        self.agent.as_ref().map(|a| a.tx.clone())
    }

    pub fn agent_connected(&self) -> bool {
        self.agent.is_some()
    }

    /// Bind an agent. Fails (returning the candidate) when one is already
    /// bound to a different connection.
    pub fn bind_agent(&mut self, handle: AgentHandle) -> Result<(), AgentHandle> {
        match &self.agent {
            Some(existing) if existing.conn_id != handle.conn_id => Err(handle),
            _ => {
                self.agent = Some(handle);
                Ok(())
            }
        }
    }

    /// Release the agent slot if it is held by `conn_id`.
    pub fn take_agent_if(&mut self, conn_id: &str) -> Option<AgentHandle> {
        if self.agent.as_ref()?.conn_id == conn_id {
            self.agent.take()
        } else {
            None
        }
    }

    /// Release the agent slot unconditionally (daemon shutdown).
    pub fn take_agent_if_any(&mut self) -> Option<AgentHandle> {
        self.agent.take()
    }

    pub fn allocate_req_id(&mut self) -> String {
        self.next_req += 1;
        format!("{}-{}", self.boot_nonce, self.next_req)
    }

    pub fn insert_pending(&mut self, req_id: String, pending: PendingRequest) {
        self.pending.insert(req_id, pending);
    }

    pub fn remove_pending(&mut self, req_id: &str) -> Option<PendingRequest> {
        self.pending.remove(req_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Deliver an outcome to the pending request with this reqId. Returns
    /// false when no such request exists (late or unknown reply); the caller
    /// logs and drops it.
    pub fn resolve(&mut self, req_id: &str, outcome: RouteOutcome) -> bool {
        match self.pending.remove(req_id) {
            Some(pending) => {
                let _ = pending.responder.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Reject every pending request. Used on agent disconnect and daemon
    /// shutdown, under the same lock that mutates the agent slot so no new
    /// request can interleave.
    pub fn reject_all(&mut self, code: &'static str, message: &str) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.responder.send(RouteOutcome::Rejected {
                code,
                message: message.to_string(),
            });
        }
    }

    /// Reject the pending requests originated by one session.
    pub fn reject_session(&mut self, session_id: &str, code: &'static str, message: &str) {
        let req_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.session_id == session_id)
            .map(|(req_id, _)| req_id.clone())
            .collect();
        for req_id in req_ids {
            if let Some(pending) = self.pending.remove(&req_id) {
                let _ = pending.responder.send(RouteOutcome::Rejected {
                    code,
                    message: message.to_string(),
                });
            }
        }
    }
}
