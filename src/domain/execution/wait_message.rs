//! Persisted suspension points

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::ExecuteId;
use crate::domain::flow::ExecutionContext;

/// A parent flow paused inside one of its subprocess nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedFrame {
    pub flow_code: String,
    pub flow_version: u32,

    /// Subprocess node in the parent flow
    pub node_id: String,

    /// Parent context at the moment the subprocess was entered
    pub context: ExecutionContext,

    /// Subprocess call depth of the parent flow
    pub depth: usize,
}

/// An execution parked at a Wait node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitMessage {
    id: String,
    execute_id: ExecuteId,
    conversation_id: String,

    /// Flow that owns the wait node
    flow_code: String,
    flow_version: u32,
    node_id: String,

    /// Context right before the wait node
    snapshot: ExecutionContext,

    /// Enclosing parent flows, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    parents: Vec<SuspendedFrame>,

    handled: bool,
    created_at: DateTime<Utc>,
}

impl WaitMessage {
    pub fn new(
        execute_id: ExecuteId,
        conversation_id: impl Into<String>,
        flow_code: impl Into<String>,
        flow_version: u32,
        node_id: impl Into<String>,
        snapshot: ExecutionContext,
    ) -> Self {
        Self {
            id: format!("wait-{}", Uuid::new_v4()),
            execute_id,
            conversation_id: conversation_id.into(),
            flow_code: flow_code.into(),
            flow_version,
            node_id: node_id.into(),
            snapshot,
            parents: Vec::new(),
            handled: false,
            created_at: Utc::now(),
        }
    }

    pub fn with_parents(mut self, parents: Vec<SuspendedFrame>) -> Self {
        self.parents = parents;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    // Getters

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn execute_id(&self) -> &ExecuteId {
        &self.execute_id
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn flow_code(&self) -> &str {
        &self.flow_code
    }

    pub fn flow_version(&self) -> u32 {
        self.flow_version
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn snapshot(&self) -> &ExecutionContext {
        &self.snapshot
    }

    pub fn parents(&self) -> &[SuspendedFrame] {
        &self.parents
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Flip `handled`; returns false when it was already set
    pub fn mark_handled(&mut self) -> bool {
        if self.handled {
            return false;
        }
        self.handled = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message() -> WaitMessage {
        WaitMessage::new(
            ExecuteId::new("exec-1"),
            "conv-1",
            "support",
            1,
            "wait_reply",
            ExecutionContext::new(json!({"q": 1})),
        )
    }

    #[test]
    fn test_new_message_is_unhandled() {
        let msg = message();
        assert!(!msg.is_handled());
        assert!(msg.id().starts_with("wait-"));
        assert_eq!(msg.conversation_id(), "conv-1");
        assert_eq!(msg.node_id(), "wait_reply");
        assert!(msg.parents().is_empty());
    }

    #[test]
    fn test_mark_handled_once() {
        let mut msg = message();
        assert!(msg.mark_handled());
        assert!(!msg.mark_handled());
        assert!(msg.is_handled());
    }

    #[test]
    fn test_serialization_round_trip() {
        let msg = message().with_parents(vec![SuspendedFrame {
            flow_code: "parent".to_string(),
            flow_version: 2,
            node_id: "call_child".to_string(),
            context: ExecutionContext::new(json!({})),
            depth: 0,
        }]);

        let json = serde_json::to_string(&msg).unwrap();
        let restored: WaitMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, msg);
    }
}
