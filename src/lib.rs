//! Flow Execution Engine
//!
//! Interprets user-authored workflow graphs for chat and AI agents:
//! - Typed nodes joined by edges, with branch, loop and subprocess control flow
//! - An expression language with transformation chains and condition trees
//! - Suspension on wait nodes, resumed by inbound conversation events
//! - Checkpointed execution logs re-driven by a retry/timeout sweep

pub mod cli;
pub mod config;
pub mod domain;
pub mod infrastructure;

pub use config::{AppConfig, EngineConfig};

use std::sync::Arc;

use tracing::info;

use domain::DomainError;
use domain::flow::NodeRunnerRegistry;
use infrastructure::execution::{InMemoryExecutionLogRepository, InMemoryWaitMessageRepository};
use infrastructure::flow::{FlowScheduler, InMemoryFlowRepository, TimeoutMonitor};
use infrastructure::runners::register_builtin_runners;

/// A scheduler wired to in-memory repositories
#[derive(Debug, Clone)]
pub struct EngineState {
    pub engine: FlowScheduler,
    pub flows: Arc<InMemoryFlowRepository>,
    pub logs: Arc<InMemoryExecutionLogRepository>,
    pub waits: Arc<InMemoryWaitMessageRepository>,
    pub config: EngineConfig,
}

impl EngineState {
    /// Timeout monitor sweeping this engine's execution logs
    pub fn monitor(&self) -> TimeoutMonitor {
        TimeoutMonitor::new(
            Arc::new(self.engine.clone()),
            self.logs.clone(),
            self.config.clone(),
        )
    }
}

/// Create an engine with the built-in runners
pub fn create_engine(config: &EngineConfig) -> Result<EngineState, DomainError> {
    create_engine_with_registry(config, NodeRunnerRegistry::new())
}

/// Create an engine from a registry already holding the host's runners; the
/// built-in runners are added to it
pub fn create_engine_with_registry(
    config: &EngineConfig,
    mut registry: NodeRunnerRegistry,
) -> Result<EngineState, DomainError> {
    register_builtin_runners(&mut registry)?;
    info!(runners = registry.registered_types().len(), "Runner registry ready");

    let flows = Arc::new(InMemoryFlowRepository::new());
    let logs = Arc::new(InMemoryExecutionLogRepository::new());
    let waits = Arc::new(InMemoryWaitMessageRepository::new());

    let engine = FlowScheduler::with_config(
        Arc::new(registry),
        flows.clone(),
        logs.clone(),
        waits.clone(),
        config.clone(),
    );

    Ok(EngineState {
        engine,
        flows,
        logs,
        waits,
        config: config.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    use domain::flow::{
        Edge, ExecutionContext, ExecutionOptions, FlowCode, FlowDefinition, FlowEngine, FlowError,
        Node, NodeInvocation, NodeRunner, NodeType, VertexResult,
    };

    #[derive(Debug)]
    struct FakeLlm;

    #[async_trait]
    impl NodeRunner for FakeLlm {
        fn node_type(&self) -> NodeType {
            NodeType::Llm
        }

        fn required_params(&self) -> &'static [&'static str] {
            &["prompt"]
        }

        async fn execute(
            &self,
            invocation: NodeInvocation<'_>,
            result: &mut VertexResult,
            _ctx: &mut ExecutionContext,
        ) -> Result<(), FlowError> {
            let prompt = invocation.param_str("prompt").unwrap_or_default();
            result.succeed(json!({ "text": prompt.to_uppercase() }));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_host_runner_alongside_builtins() {
        let registry = NodeRunnerRegistry::new().with_runner(Arc::new(FakeLlm)).unwrap();
        let state = create_engine_with_registry(&EngineConfig::default(), registry).unwrap();

        let flow = FlowDefinition::new(FlowCode::new("shout").unwrap(), "Shout")
            .with_node(Node::new("start", NodeType::Start))
            .with_node(Node::new("llm", NodeType::Llm).with_param("prompt", "${start.q}".parse().unwrap()))
            .with_node(Node::new("end", NodeType::End).with_param("answer", "${llm.text}".parse().unwrap()))
            .with_edge(Edge::new("start", "llm"))
            .with_edge(Edge::new("llm", "end"));

        let result = state
            .engine
            .execute(
                Arc::new(flow),
                ExecutionContext::new(json!({"q": "hi"})),
                ExecutionOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.output, json!({"answer": "HI"}));
    }

    #[test]
    fn test_unregistered_types_fail_validation() {
        let state = create_engine(&EngineConfig::default()).unwrap();
        let flow = FlowDefinition::new(FlowCode::new("kb").unwrap(), "KB")
            .with_node(Node::new("start", NodeType::Start))
            .with_node(Node::new("search", NodeType::KnowledgeRetrieval))
            .with_edge(Edge::new("start", "search"));

        let errors = state.engine.validate(&flow);
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].to_string(),
            "Node 'search' has type 'knowledge_retrieval' with no registered runner"
        );
    }
}
