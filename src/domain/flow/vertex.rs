//! Per-node execution outcome

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node_types::NodeType;

/// Failure payload reported by a node runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub message: String,

    /// Whether the failure is transient and the execution may be retried
    #[serde(default)]
    pub retryable: bool,
}

impl NodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

/// Recorded outcome of one node visit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VertexResult {
    pub node_id: String,

    pub node_type: NodeType,

    pub success: bool,

    pub output: Value,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub debug_log: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<NodeError>,

    /// Loop iteration index when the visit happened inside a loop body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,

    pub elapsed_ms: u64,
}

impl VertexResult {
    /// Start a result for a node visit; success until a runner says otherwise
    pub fn new(node_id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            success: true,
            output: Value::Null,
            debug_log: Vec::new(),
            error: None,
            iteration: None,
            elapsed_ms: 0,
        }
    }

    pub fn with_iteration(mut self, iteration: Option<usize>) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn succeed(&mut self, output: Value) {
        self.success = true;
        self.output = output;
        self.error = None;
    }

    pub fn fail(&mut self, error: NodeError) {
        self.success = false;
        self.error = Some(error);
    }

    pub fn log(&mut self, line: impl Into<String>) {
        self.debug_log.push(line.into());
    }

    pub fn is_retryable(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.retryable)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }
}
