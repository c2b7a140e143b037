//! Human-in-the-loop pending-tool map (spec §4.4 "async tool").
//!
//! A tool may return [`crate::ToolOutcome::Pending`] instead of a result.
//! The executor stores the pending call here, keyed by call id, scoped to
//! one conversation; the Conversation Driver exposes `resolve`/`reject` to
//! an external caller and suspends the current turn while any call for
//! that conversation remains pending.
//!
//! Grounded on the teacher's `ApprovalStore` (`runtime/approval.rs`):
//! `oneshot::Sender` per pending entry, insert/resolve/reject by id,
//! explicit timeout rather than an implicit default (DESIGN.md Open
//! Question decision 3).

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;

/// What the external caller supplies to unblock a pending tool call.
#[derive(Debug, Clone)]
pub enum PendingOutcome {
    Resolved(serde_json::Value),
    Rejected { reason: String },
}

pub struct PendingTool {
    pub call_id: String,
    pub tool_name: String,
    pub reason: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    respond: oneshot::Sender<PendingOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingToolInfo {
    pub call_id: String,
    pub tool_name: String,
    pub reason: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingTool> for PendingToolInfo {
    fn from(p: &PendingTool) -> Self {
        Self {
            call_id: p.call_id.clone(),
            tool_name: p.tool_name.clone(),
            reason: p.reason.clone(),
            message: p.message.clone(),
            created_at: p.created_at,
        }
    }
}

/// Per-conversation pending map. One instance lives for the duration of a
/// single run's Conversation Driver.
pub struct PendingToolMap {
    pending: RwLock<HashMap<String, PendingTool>>,
    timeout: Duration,
}

impl PendingToolMap {
    /// `timeout` is required configuration (spec §9 Open Question 3) — no
    /// implicit default exists at this layer; the engine reads it from
    /// `ToolPolicy::pending_timeout_ms` and rejects config without one
    /// whenever an async-capable tool is registered.
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register a pending call, returning a receiver the driver awaits
    /// (subject to `timeout`) to resume the tool loop.
    pub fn insert(
        &self,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        let call_id = call_id.into();
        let pending = PendingTool {
            call_id: call_id.clone(),
            tool_name: tool_name.into(),
            reason: reason.into(),
            message: message.into(),
            created_at: Utc::now(),
            respond: tx,
        };
        self.pending.write().insert(call_id, pending);
        rx
    }

    pub fn resolve(&self, call_id: &str, result: serde_json::Value) -> bool {
        if let Some(p) = self.pending.write().remove(call_id) {
            let _ = p.respond.send(PendingOutcome::Resolved(result));
            return true;
        }
        false
    }

    pub fn reject(&self, call_id: &str, reason: impl Into<String>) -> bool {
        if let Some(p) = self.pending.write().remove(call_id) {
            let _ = p.respond.send(PendingOutcome::Rejected {
                reason: reason.into(),
            });
            return true;
        }
        false
    }

    pub fn remove_expired(&self, call_id: &str) {
        self.pending.write().remove(call_id);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.read().is_empty()
    }

    pub fn list(&self) -> Vec<PendingToolInfo> {
        self.pending.read().values().map(PendingToolInfo::from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> PendingToolMap {
        PendingToolMap::new(Duration::from_secs(300))
    }

    #[tokio::test]
    async fn resolve_delivers_result_to_receiver() {
        let map = map();
        let rx = map.insert("c1", "deploy", "needs_approval", "confirm deploy?");
        assert!(map.resolve("c1", serde_json::json!({"ok": true})));
        let outcome = rx.await.unwrap();
        match outcome {
            PendingOutcome::Resolved(v) => assert_eq!(v, serde_json::json!({"ok": true})),
            _ => panic!("expected Resolved"),
        }
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn reject_delivers_reason() {
        let map = map();
        let rx = map.insert("c1", "deploy", "needs_approval", "confirm?");
        assert!(map.reject("c1", "denied by reviewer"));
        match rx.await.unwrap() {
            PendingOutcome::Rejected { reason } => assert_eq!(reason, "denied by reviewer"),
            _ => panic!("expected Rejected"),
        }
    }

    #[test]
    fn resolve_unknown_call_id_returns_false() {
        let map = map();
        assert!(!map.resolve("missing", serde_json::json!(null)));
    }

    #[test]
    fn list_reflects_pending_entries() {
        let map = map();
        let _rx = map.insert("c1", "tool", "r", "m");
        let entries = map.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].call_id, "c1");
    }
}
