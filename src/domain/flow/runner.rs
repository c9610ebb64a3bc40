//! Node runner contract and registry
//!
//! A runner implements the behavior of one node type. The scheduler resolves
//! the node's params before dispatch; the runner reports business failures
//! on the [`VertexResult`] and returns `Err` only for conditions that must
//! abort the whole execution.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use super::context::ExecutionContext;
use super::entity::Node;
use super::error::FlowError;
use super::node_types::NodeType;
use super::vertex::VertexResult;
use crate::domain::DomainError;

/// Everything a runner gets to see about the node being executed
#[derive(Debug, Clone, Copy)]
pub struct NodeInvocation<'a> {
    pub execute_id: &'a str,

    pub node: &'a Node,

    /// Params resolved against the context
    pub params: &'a Map<String, Value>,

    /// Results recorded so far in this execution, oldest first
    pub upstream: &'a [VertexResult],
}

impl<'a> NodeInvocation<'a> {
    pub fn param(&self, name: &str) -> Option<&'a Value> {
        self.params.get(name)
    }

    pub fn param_str(&self, name: &str) -> Option<&'a str> {
        self.params.get(name).and_then(Value::as_str)
    }

    /// Resolved params as a JSON object
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }
}

/// Pluggable behavior of one node type
#[async_trait]
pub trait NodeRunner: Send + Sync + Debug {
    /// Node type this runner is registered for
    fn node_type(&self) -> NodeType;

    /// Params that must be declared on every node of this type
    fn required_params(&self) -> &'static [&'static str] {
        &[]
    }

    /// Execute the node, writing the outcome to `result`
    async fn execute(
        &self,
        invocation: NodeInvocation<'_>,
        result: &mut VertexResult,
        ctx: &mut ExecutionContext,
    ) -> Result<(), FlowError>;
}

/// Explicit mapping from node type to runner, built once at startup
#[derive(Debug, Default, Clone)]
pub struct NodeRunnerRegistry {
    runners: HashMap<NodeType, Arc<dyn NodeRunner>>,
}

impl NodeRunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runner; each type may be registered once
    pub fn register(&mut self, runner: Arc<dyn NodeRunner>) -> Result<(), DomainError> {
        let node_type = runner.node_type();

        if node_type == NodeType::Unknown || node_type.is_control() {
            return Err(DomainError::validation(format!(
                "Node type '{}' cannot have a runner",
                node_type
            )));
        }

        if self.runners.contains_key(&node_type) {
            return Err(DomainError::conflict(format!(
                "Runner for '{}' already registered",
                node_type
            )));
        }

        info!(node_type = %node_type, "Registering node runner");
        self.runners.insert(node_type, runner);
        Ok(())
    }

    pub fn with_runner(mut self, runner: Arc<dyn NodeRunner>) -> Result<Self, DomainError> {
        self.register(runner)?;
        Ok(self)
    }

    pub fn get(&self, node_type: NodeType) -> Option<&Arc<dyn NodeRunner>> {
        self.runners.get(&node_type)
    }

    /// Whether nodes of this type can be executed: control types are handled
    /// by the scheduler, everything else needs a runner
    pub fn supports(&self, node_type: NodeType) -> bool {
        node_type.is_control() || self.runners.contains_key(&node_type)
    }

    pub fn required_params(&self, node_type: NodeType) -> &'static [&'static str] {
        self.runners
            .get(&node_type)
            .map(|r| r.required_params())
            .unwrap_or(&[])
    }

    pub fn registered_types(&self) -> Vec<NodeType> {
        let mut types: Vec<NodeType> = self.runners.keys().copied().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct EchoRunner;

    #[async_trait]
    impl NodeRunner for EchoRunner {
        fn node_type(&self) -> NodeType {
            NodeType::Code
        }

        fn required_params(&self) -> &'static [&'static str] {
            &["source"]
        }

        async fn execute(
            &self,
            invocation: NodeInvocation<'_>,
            result: &mut VertexResult,
            _ctx: &mut ExecutionContext,
        ) -> Result<(), FlowError> {
            result.succeed(invocation.params_value());
            Ok(())
        }
    }

    #[derive(Debug)]
    struct SelectorRunner;

    #[async_trait]
    impl NodeRunner for SelectorRunner {
        fn node_type(&self) -> NodeType {
            NodeType::Selector
        }

        async fn execute(
            &self,
            _invocation: NodeInvocation<'_>,
            _result: &mut VertexResult,
            _ctx: &mut ExecutionContext,
        ) -> Result<(), FlowError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = NodeRunnerRegistry::new().with_runner(Arc::new(EchoRunner)).unwrap();

        assert!(registry.get(NodeType::Code).is_some());
        assert!(registry.get(NodeType::Llm).is_none());
        assert_eq!(registry.required_params(NodeType::Code), &["source"]);
        assert_eq!(registry.registered_types(), vec![NodeType::Code]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = NodeRunnerRegistry::new();
        registry.register(Arc::new(EchoRunner)).unwrap();
        let err = registry.register(Arc::new(EchoRunner)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict { .. }));
    }

    #[test]
    fn test_control_types_cannot_be_registered() {
        let err = NodeRunnerRegistry::new()
            .with_runner(Arc::new(SelectorRunner))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation { .. }));
    }

    #[test]
    fn test_supports() {
        let registry = NodeRunnerRegistry::new().with_runner(Arc::new(EchoRunner)).unwrap();
        assert!(registry.supports(NodeType::Code));
        assert!(registry.supports(NodeType::Loop));
        assert!(!registry.supports(NodeType::Llm));
        assert!(!registry.supports(NodeType::Unknown));
    }

    #[tokio::test]
    async fn test_runner_receives_resolved_params() {
        let node = Node::new("code", NodeType::Code);
        let mut params = Map::new();
        params.insert("source".to_string(), json!("return 1"));
        let invocation = NodeInvocation {
            execute_id: "exec-1",
            node: &node,
            params: &params,
            upstream: &[],
        };

        let mut result = VertexResult::new("code", NodeType::Code);
        let mut ctx = ExecutionContext::new(json!({}));
        EchoRunner.execute(invocation, &mut result, &mut ctx).await.unwrap();

        assert_eq!(result.output, json!({"source": "return 1"}));
        assert_eq!(invocation.param_str("source"), Some("return 1"));
    }
}
