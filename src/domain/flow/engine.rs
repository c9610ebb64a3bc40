//! Engine trait and result types

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::context::ExecutionContext;
use super::entity::FlowDefinition;
use super::error::{FlowError, ValidationError};
use super::vertex::VertexResult;
use crate::domain::execution::{ExecuteId, ExecutionStatus};

#[cfg(test)]
use mockall::automock;

/// Outcome of an execute, resume or retry call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub execute_id: ExecuteId,

    pub status: ExecutionStatus,

    pub final_context: ExecutionContext,

    /// End node output on success
    pub output: Value,

    /// Results of the node visits made by this call
    pub vertex_results: Vec<VertexResult>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Wait message created when the execution suspended
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_message_id: Option<String>,
}

impl ExecutionResult {
    pub fn success(
        execute_id: ExecuteId,
        final_context: ExecutionContext,
        output: Value,
        vertex_results: Vec<VertexResult>,
    ) -> Self {
        Self {
            execute_id,
            status: ExecutionStatus::Success,
            final_context,
            output,
            vertex_results,
            error: None,
            wait_message_id: None,
        }
    }

    pub fn suspended(
        execute_id: ExecuteId,
        final_context: ExecutionContext,
        vertex_results: Vec<VertexResult>,
        wait_message_id: impl Into<String>,
    ) -> Self {
        Self {
            execute_id,
            status: ExecutionStatus::Suspended,
            final_context,
            output: Value::Null,
            vertex_results,
            error: None,
            wait_message_id: Some(wait_message_id.into()),
        }
    }

    /// Failed or cancelled outcome
    pub fn stopped(
        execute_id: ExecuteId,
        status: ExecutionStatus,
        final_context: ExecutionContext,
        vertex_results: Vec<VertexResult>,
        error: &FlowError,
    ) -> Self {
        Self {
            execute_id,
            status,
            final_context,
            output: Value::Null,
            vertex_results,
            error: Some(error.to_string()),
            wait_message_id: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Receives every vertex result as it is recorded, e.g. for test runs in
/// the authoring UI
pub trait ExecutionObserver: Send + Sync + std::fmt::Debug {
    fn on_vertex(&self, execute_id: &ExecuteId, result: &VertexResult);
}

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Checked before every node dispatch
    pub cancellation: CancellationToken,

    pub observer: Option<Arc<dyn ExecutionObserver>>,
}

impl ExecutionOptions {
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }
}

/// Flow execution entry points exposed to the hosting application
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FlowEngine: Send + Sync + std::fmt::Debug {
    /// Check a flow against the registered runners and configured bounds
    fn validate(&self, flow: &FlowDefinition) -> Vec<ValidationError>;

    /// Run a flow from its start node
    async fn execute(
        &self,
        flow: Arc<FlowDefinition>,
        initial_context: ExecutionContext,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError>;

    /// Deliver an inbound conversation event to the earliest matching wait
    ///
    /// Returns None when no pending wait accepted the event.
    async fn resume(
        &self,
        conversation_id: &str,
        event: Value,
        options: ExecutionOptions,
    ) -> Result<Option<ExecutionResult>, FlowError>;

    /// Re-drive a running execution from its last checkpoint
    async fn retry(
        &self,
        execute_id: &ExecuteId,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::node_types::NodeType;
    use serde_json::json;

    #[test]
    fn test_success_result() {
        let result = ExecutionResult::success(
            ExecuteId::new("exec-1"),
            ExecutionContext::new(json!({})),
            json!({"answer": 42}),
            vec![VertexResult::new("end", NodeType::End)],
        );

        assert!(result.is_success());
        assert_eq!(result.output, json!({"answer": 42}));
        assert!(result.error.is_none());
    }

    #[test]
    fn test_stopped_result_carries_error() {
        let err = FlowError::node_failed("http", "404 Not Found", false);
        let result = ExecutionResult::stopped(
            ExecuteId::new("exec-1"),
            ExecutionStatus::Failed,
            ExecutionContext::new(json!({})),
            vec![],
            &err,
        );

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("Node 'http' failed: 404 Not Found"));
    }

    #[test]
    fn test_serialization_omits_empty_fields() {
        let result = ExecutionResult::suspended(
            ExecuteId::new("exec-1"),
            ExecutionContext::new(json!({})),
            vec![],
            "wait-1",
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "suspended");
        assert_eq!(json["wait_message_id"], "wait-1");
        assert!(json.get("error").is_none());
    }
}
