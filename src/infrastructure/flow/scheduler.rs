//! DAG scheduler implementation
//!
//! Walks a flow node by node from its start node, following the normal edge
//! out of each node or the labelled edge the node selected. Loop bodies and
//! subprocess children are walked recursively through the same chain walk.
//! A Wait node unwinds the whole walk into a [`WaitMessage`] carrying the
//! snapshot of the waiting flow plus one frame per enclosing parent flow;
//! resume rebuilds the walk from those frames.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::execution::{
    Checkpoint, ExecuteId, ExecutionLog, ExecutionLogRepository, ExecutionStatus,
    SuspendedFrame, WaitMessage, WaitMessageRepository,
};
use crate::domain::flow::{
    EDGE_BODY, EDGE_ELSE, EDGE_ERROR, EvaluationError, ExecutionContext, ExecutionOptions,
    ExecutionResult, FlowDefinition, FlowEngine, FlowError, FlowRepository, FlowValidator, Node,
    NodeError, NodeInvocation, NodeRunnerRegistry, NodeType, OnErrorAction, ResolutionError,
    SubprocessSettings, ValidationError, ValueKind, VertexResult,
};

/// Where a chain walk begins
enum Entry {
    /// The flow's start node
    Start,

    /// Visit this node first
    At(String),

    /// Follow the edge leaving an already completed node
    After {
        node_id: String,
        label: Option<String>,
    },

    /// Settle an outcome produced outside the walk, then continue after it
    Settle {
        node_id: String,
        outcome: NodeOutcome,
    },
}

/// Result of visiting one node
enum NodeOutcome {
    /// `label` picks a labelled outgoing edge; `failure` is set when the
    /// node failed and its `on_error` policy decides what happens next
    Done {
        result: VertexResult,
        label: Option<String>,
        failure: Option<FlowError>,
    },

    /// An End node completed
    Ended(VertexResult),

    Suspended(Suspension),
}

impl NodeOutcome {
    fn done(result: VertexResult, label: Option<String>) -> Self {
        Self::Done {
            result,
            label,
            failure: None,
        }
    }

    fn failed(mut result: VertexResult, started: Instant, failure: FlowError) -> Self {
        if result.success {
            result.fail(NodeError {
                message: failure.to_string(),
                retryable: failure.is_retryable(),
            });
        }
        result.elapsed_ms = elapsed_ms(started);
        Self::Done {
            result,
            label: None,
            failure: Some(failure),
        }
    }
}

/// How a chain walk stopped
enum ChainOutcome {
    /// Reached an End node
    Ended(Value),

    /// Ran out of edges; carries the last node's output
    Exhausted(Value),

    Suspended(Suspension),
}

/// A Wait node reached somewhere in the call stack
struct Suspension {
    conversation_id: String,
    flow_code: String,
    flow_version: u32,
    node_id: String,
    snapshot: ExecutionContext,

    /// Enclosing parent flows, outermost first
    parents: Vec<SuspendedFrame>,
}

enum Step {
    Next {
        node_id: Option<String>,
        output: Value,
    },
    Stop(ChainOutcome),
}

/// Position of a chain walk in the call stack
#[derive(Debug, Clone, Copy, Default)]
struct Scope {
    /// Subprocess depth; 0 for the top-level flow
    depth: usize,

    in_loop: bool,

    /// Innermost loop iteration, stamped on vertex results
    iteration: Option<usize>,
}

impl Scope {
    fn at_depth(depth: usize) -> Self {
        Self {
            depth,
            ..Self::default()
        }
    }

    /// Checkpoints are taken only on the top-level main path
    fn is_main_path(&self) -> bool {
        self.depth == 0 && !self.in_loop
    }

    fn loop_body(self, iteration: usize) -> Self {
        Self {
            in_loop: true,
            iteration: Some(iteration),
            ..self
        }
    }

    fn child(self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self
        }
    }
}

/// Per-call bookkeeping: the vertex results recorded so far and the caller's
/// options
struct RunState {
    execute_id: ExecuteId,
    options: ExecutionOptions,
    vertex_results: Vec<VertexResult>,
}

impl RunState {
    fn new(execute_id: ExecuteId, options: ExecutionOptions) -> Self {
        Self {
            execute_id,
            options,
            vertex_results: Vec::new(),
        }
    }

    fn record(&mut self, result: VertexResult) {
        if let Some(observer) = &self.options.observer {
            observer.on_vertex(&self.execute_id, &result);
        }
        self.vertex_results.push(result);
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn find_node<'f>(flow: &'f FlowDefinition, node_id: &str) -> Result<&'f Node, FlowError> {
    flow.node(node_id).ok_or_else(|| {
        FlowError::Validation(vec![ValidationError::UnknownReference {
            node_id: flow.code().to_string(),
            reference: node_id.to_string(),
        }])
    })
}

fn missing_settings(node: &Node, settings: &str) -> FlowError {
    FlowError::Validation(vec![ValidationError::MissingSettings {
        node_id: node.id().to_string(),
        settings: settings.to_string(),
    }])
}

fn next_node(flow: &FlowDefinition, node_id: &str, label: Option<&str>) -> Option<String> {
    match label {
        Some(label) => flow.next_labelled(node_id, label),
        None => flow.next_normal(node_id),
    }
    .map(str::to_string)
}

fn resolve_params(node: &Node, ctx: &ExecutionContext) -> Result<Map<String, Value>, ResolutionError> {
    node.params()
        .iter()
        .map(|(name, expression)| Ok((name.clone(), expression.resolve(ctx)?)))
        .collect()
}

/// Output recorded for a failed node whose failure was absorbed
fn failure_output(result: &VertexResult, failure: &FlowError) -> Value {
    match &result.output {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.insert("error".to_string(), Value::String(failure.to_string()));
            Value::Object(fields)
        }
        _ => json!({ "error": failure.to_string() }),
    }
}

fn visit_selector(
    flow: &FlowDefinition,
    node: &Node,
    ctx: &ExecutionContext,
    scope: Scope,
) -> NodeOutcome {
    let started = Instant::now();
    let mut result = VertexResult::new(node.id(), NodeType::Selector).with_iteration(scope.iteration);

    let mut chosen = None;
    for branch in node.branches() {
        match branch.condition.evaluate(ctx) {
            Ok(true) => {
                chosen = Some(branch.id.clone());
                break;
            }
            Ok(false) => result.log(format!("branch '{}' did not match", branch.id)),
            Err(e) => return NodeOutcome::failed(result, started, FlowError::evaluation(node.id(), e)),
        }
    }

    let branch = match chosen {
        Some(branch) => branch,
        None if flow.next_labelled(node.id(), EDGE_ELSE).is_some() => EDGE_ELSE.to_string(),
        None => {
            let error = EvaluationError::no_branch_matched(node.id());
            return NodeOutcome::failed(result, started, FlowError::evaluation(node.id(), error));
        }
    };

    result.log(format!("took branch '{}'", branch));
    result.succeed(json!({ "branch": branch }));
    result.elapsed_ms = elapsed_ms(started);
    NodeOutcome::done(result, Some(branch))
}

/// Turn a finished child walk into the subprocess node's outcome
fn complete_subprocess(
    node: &Node,
    settings: &SubprocessSettings,
    mut result: VertexResult,
    started: Instant,
    child_ctx: &ExecutionContext,
    child: Result<ChainOutcome, FlowError>,
) -> Result<NodeOutcome, FlowError> {
    match child {
        Ok(ChainOutcome::Ended(output)) | Ok(ChainOutcome::Exhausted(output)) => {
            let merged = match settings.output_node.as_deref() {
                None => output,
                Some(output_node) => match child_ctx.node_output(output_node) {
                    Some(value) => value.clone(),
                    None => {
                        let failure = FlowError::node_failed(
                            node.id(),
                            format!("Output node '{}' produced no output", output_node),
                            false,
                        );
                        return Ok(NodeOutcome::failed(result, started, failure));
                    }
                },
            };
            result.succeed(merged);
            result.elapsed_ms = elapsed_ms(started);
            Ok(NodeOutcome::done(result, None))
        }
        Ok(ChainOutcome::Suspended(suspension)) => Ok(NodeOutcome::Suspended(suspension)),
        Err(e) if e.is_node_failure() => Ok(NodeOutcome::failed(result, started, e)),
        Err(e) => Err(e),
    }
}

/// Flow scheduler implementing [`FlowEngine`]
///
/// Holds no per-execution state; every call works on its own context, so one
/// scheduler serves any number of concurrent executions.
#[derive(Debug, Clone)]
pub struct FlowScheduler {
    registry: Arc<NodeRunnerRegistry>,
    flows: Arc<dyn FlowRepository>,
    logs: Arc<dyn ExecutionLogRepository>,
    waits: Arc<dyn WaitMessageRepository>,
    config: EngineConfig,
}

impl FlowScheduler {
    /// Create a scheduler with the default engine configuration
    pub fn new(
        registry: Arc<NodeRunnerRegistry>,
        flows: Arc<dyn FlowRepository>,
        logs: Arc<dyn ExecutionLogRepository>,
        waits: Arc<dyn WaitMessageRepository>,
    ) -> Self {
        Self::with_config(registry, flows, logs, waits, EngineConfig::default())
    }

    pub fn with_config(
        registry: Arc<NodeRunnerRegistry>,
        flows: Arc<dyn FlowRepository>,
        logs: Arc<dyn ExecutionLogRepository>,
        waits: Arc<dyn WaitMessageRepository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            flows,
            logs,
            waits,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run an execution on its own tokio task
    pub fn spawn_execute(
        &self,
        flow: Arc<FlowDefinition>,
        initial_context: ExecutionContext,
        options: ExecutionOptions,
    ) -> JoinHandle<Result<ExecutionResult, FlowError>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.execute(flow, initial_context, options).await })
    }

    async fn load_flow(&self, code: &str, version: Option<u32>) -> Result<Arc<FlowDefinition>, FlowError> {
        self.flows
            .get_by_code(code, version)
            .await?
            .map(Arc::new)
            .ok_or_else(|| FlowError::flow_not_found(code, version))
    }

    async fn transition(
        &self,
        execute_id: &ExecuteId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<(), FlowError> {
        if !self.logs.transition_status(execute_id, from, to, error).await? {
            warn!(
                execute_id = %execute_id,
                to = %to,
                "Execution log was not in the expected status"
            );
        }
        Ok(())
    }

    /// Walk a chain of nodes until an End node, a dead end, or a suspension
    fn run_chain<'a>(
        &'a self,
        flow: Arc<FlowDefinition>,
        entry: Entry,
        ctx: &'a mut ExecutionContext,
        run: &'a mut RunState,
        scope: Scope,
    ) -> BoxFuture<'a, Result<ChainOutcome, FlowError>> {
        async move {
            let mut last_output = Value::Null;

            let mut current = match entry {
                Entry::Start => match flow.start_node() {
                    Some(node) => Some(node.id().to_string()),
                    None => return Err(FlowError::Validation(vec![ValidationError::MissingStartNode])),
                },
                Entry::At(node_id) => Some(node_id),
                Entry::After { node_id, label } => next_node(&flow, &node_id, label.as_deref()),
                Entry::Settle { node_id, outcome } => {
                    let node = find_node(&flow, &node_id)?;
                    match self.settle(&flow, node, outcome, ctx, run, scope).await? {
                        Step::Next { node_id, output } => {
                            last_output = output;
                            node_id
                        }
                        Step::Stop(outcome) => return Ok(outcome),
                    }
                }
            };

            while let Some(node_id) = current {
                if run.options.cancellation.is_cancelled() {
                    info!(execute_id = %run.execute_id, node_id = %node_id, "Execution cancelled");
                    return Err(FlowError::Cancelled);
                }

                let node = find_node(&flow, &node_id)?;
                let outcome = self.visit(&flow, node, ctx, run, scope).await?;

                match self.settle(&flow, node, outcome, ctx, run, scope).await? {
                    Step::Next { node_id, output } => {
                        last_output = output;
                        current = node_id;
                    }
                    Step::Stop(outcome) => return Ok(outcome),
                }
            }

            Ok(ChainOutcome::Exhausted(last_output))
        }
        .boxed()
    }

    async fn visit(
        &self,
        flow: &Arc<FlowDefinition>,
        node: &Node,
        ctx: &mut ExecutionContext,
        run: &mut RunState,
        scope: Scope,
    ) -> Result<NodeOutcome, FlowError> {
        debug!(
            execute_id = %run.execute_id,
            node_id = %node.id(),
            node_type = %node.node_type(),
            depth = scope.depth,
            iteration = ?scope.iteration,
            "Visiting node"
        );

        match node.node_type() {
            NodeType::Selector => Ok(visit_selector(flow, node, ctx, scope)),
            NodeType::Loop => self.visit_loop(flow, node, ctx, run, scope).await,
            NodeType::Subprocess => self.visit_subprocess(flow, node, ctx, run, scope).await,
            NodeType::Wait => self.visit_wait(flow, node, ctx, run, scope),
            _ => self.visit_runner(node, ctx, run, scope).await,
        }
    }

    /// Record a node's outcome and pick the next node
    async fn settle(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        outcome: NodeOutcome,
        ctx: &mut ExecutionContext,
        run: &mut RunState,
        scope: Scope,
    ) -> Result<Step, FlowError> {
        let (result, label, failure) = match outcome {
            NodeOutcome::Suspended(suspension) => {
                return Ok(Step::Stop(ChainOutcome::Suspended(suspension)));
            }
            NodeOutcome::Ended(result) => {
                let output = result.output.clone();
                ctx.record_output(node.id(), output.clone());
                run.record(result);
                return Ok(Step::Stop(ChainOutcome::Ended(output)));
            }
            NodeOutcome::Done {
                result,
                label,
                failure,
            } => (result, label, failure),
        };

        let (output, label) = match failure {
            None => (result.output.clone(), label),
            Some(failure) => {
                let output = failure_output(&result, &failure);
                match node.on_error() {
                    OnErrorAction::Fail => {
                        run.record(result);
                        return Err(failure);
                    }
                    OnErrorAction::Continue => {
                        warn!(
                            execute_id = %run.execute_id,
                            node_id = %node.id(),
                            error = %failure,
                            "Node failed, continuing"
                        );
                        (output, None)
                    }
                    OnErrorAction::Fallback => {
                        warn!(
                            execute_id = %run.execute_id,
                            node_id = %node.id(),
                            error = %failure,
                            "Node failed, taking error edge"
                        );
                        (output, Some(EDGE_ERROR.to_string()))
                    }
                }
            }
        };

        run.record(result);
        ctx.record_output(node.id(), output.clone());

        if scope.is_main_path() {
            let checkpoint = Checkpoint::new(node.id(), ctx.clone()).with_label(label.clone());
            self.logs.save_checkpoint(&run.execute_id, checkpoint).await?;
        }

        Ok(Step::Next {
            node_id: next_node(flow, node.id(), label.as_deref()),
            output,
        })
    }

    async fn visit_runner(
        &self,
        node: &Node,
        ctx: &mut ExecutionContext,
        run: &mut RunState,
        scope: Scope,
    ) -> Result<NodeOutcome, FlowError> {
        let started = Instant::now();
        let mut result = VertexResult::new(node.id(), node.node_type()).with_iteration(scope.iteration);

        let params = match resolve_params(node, ctx) {
            Ok(params) => params,
            Err(e) => {
                let failure = FlowError::node_failed(node.id(), e.to_string(), false);
                return Ok(NodeOutcome::failed(result, started, failure));
            }
        };

        let runner = self.registry.get(node.node_type()).ok_or_else(|| {
            FlowError::Validation(vec![ValidationError::UnregisteredNodeType {
                node_id: node.id().to_string(),
                node_type: node.node_type().to_string(),
            }])
        })?;

        let invocation = NodeInvocation {
            execute_id: run.execute_id.as_str(),
            node,
            params: &params,
            upstream: &run.vertex_results,
        };
        runner
            .execute(invocation, &mut result, ctx)
            .await
            .map_err(|e| match e {
                FlowError::Aborted { .. } | FlowError::Cancelled => e,
                other => FlowError::aborted(node.id(), other.to_string()),
            })?;
        result.elapsed_ms = elapsed_ms(started);

        if !result.success {
            let message = result.error_message().unwrap_or("Node failed").to_string();
            let failure = FlowError::node_failed(node.id(), message, result.is_retryable());
            return Ok(NodeOutcome::failed(result, started, failure));
        }

        if node.node_type() == NodeType::End {
            return Ok(NodeOutcome::Ended(result));
        }
        Ok(NodeOutcome::done(result, None))
    }

    async fn visit_loop(
        &self,
        flow: &Arc<FlowDefinition>,
        node: &Node,
        ctx: &mut ExecutionContext,
        run: &mut RunState,
        scope: Scope,
    ) -> Result<NodeOutcome, FlowError> {
        let started = Instant::now();
        let mut result = VertexResult::new(node.id(), NodeType::Loop).with_iteration(scope.iteration);

        let settings = node.loop_settings().ok_or_else(|| missing_settings(node, "loop"))?;
        let body = flow
            .next_labelled(node.id(), EDGE_BODY)
            .ok_or_else(|| missing_settings(node, EDGE_BODY))?;

        let items = match &settings.items {
            None => None,
            Some(expression) => match expression.resolve(ctx) {
                Ok(Value::Array(items)) => Some(items),
                Ok(other) => {
                    let message = format!("Loop items must be an array, got {}", ValueKind::of(&other));
                    let failure = FlowError::node_failed(node.id(), message, false);
                    return Ok(NodeOutcome::failed(result, started, failure));
                }
                Err(e) => {
                    let failure = FlowError::node_failed(node.id(), e.to_string(), false);
                    return Ok(NodeOutcome::failed(result, started, failure));
                }
            },
        };

        let guard = settings.max_iterations.min(self.config.max_loop_iterations) as usize;
        let mut results = Vec::new();
        let mut index = 0;

        while index < guard {
            let item = match &items {
                Some(items) => match items.get(index) {
                    Some(item) => item.clone(),
                    None => break,
                },
                None => Value::Null,
            };
            ctx.record_output(node.id(), json!({ "index": index, "item": item }));

            if let Some(condition) = &settings.break_condition {
                match condition.evaluate(ctx) {
                    Ok(true) => {
                        result.log(format!("break condition met before iteration {}", index));
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        return Ok(NodeOutcome::failed(result, started, FlowError::evaluation(node.id(), e)));
                    }
                }
            }

            let body_outcome = self
                .run_chain(flow.clone(), Entry::At(body.to_string()), ctx, run, scope.loop_body(index))
                .await;

            match body_outcome {
                Ok(ChainOutcome::Ended(output)) | Ok(ChainOutcome::Exhausted(output)) => results.push(output),
                Ok(ChainOutcome::Suspended(suspension)) => {
                    return Err(FlowError::SuspendInLoop {
                        node_id: suspension.node_id,
                    });
                }
                Err(e) if e.is_node_failure() && node.on_error() == OnErrorAction::Continue => {
                    result.log(format!("iteration {} failed: {}", index, e));
                    results.push(json!({ "error": e.to_string() }));
                }
                Err(e) if e.is_node_failure() => return Ok(NodeOutcome::failed(result, started, e)),
                Err(e) => return Err(e),
            }

            index += 1;
        }

        if index == guard && items.as_ref().is_none_or(|items| items.len() > guard) {
            warn!(
                execute_id = %run.execute_id,
                node_id = %node.id(),
                guard,
                "Loop stopped by iteration guard"
            );
            result.log(format!("iteration guard of {} reached", guard));
        }

        result.succeed(json!({ "iterations": index, "results": results }));
        result.elapsed_ms = elapsed_ms(started);
        Ok(NodeOutcome::done(result, None))
    }

    async fn visit_subprocess(
        &self,
        flow: &Arc<FlowDefinition>,
        node: &Node,
        ctx: &mut ExecutionContext,
        run: &mut RunState,
        scope: Scope,
    ) -> Result<NodeOutcome, FlowError> {
        let started = Instant::now();
        let result = VertexResult::new(node.id(), NodeType::Subprocess).with_iteration(scope.iteration);

        let settings = node.subprocess().ok_or_else(|| missing_settings(node, "subprocess"))?;

        if scope.depth >= self.config.max_subprocess_depth {
            let failure = FlowError::SubprocessDepthExceeded {
                node_id: node.id().to_string(),
                max: self.config.max_subprocess_depth,
            };
            return Ok(NodeOutcome::failed(result, started, failure));
        }

        let input = match resolve_params(node, ctx) {
            Ok(params) => Value::Object(params),
            Err(e) => {
                let failure = FlowError::node_failed(node.id(), e.to_string(), false);
                return Ok(NodeOutcome::failed(result, started, failure));
            }
        };

        let child = match self.flows.get_by_code(&settings.flow_code, settings.version).await? {
            Some(child) => Arc::new(child),
            None => {
                let failure = FlowError::flow_not_found(&settings.flow_code, settings.version);
                return Ok(NodeOutcome::failed(result, started, failure));
            }
        };

        let errors = self.validate(&child);
        if !errors.is_empty() {
            return Ok(NodeOutcome::failed(result, started, FlowError::Validation(errors)));
        }

        debug!(
            execute_id = %run.execute_id,
            node_id = %node.id(),
            child_flow = %child.code(),
            child_version = child.version(),
            "Entering subprocess"
        );

        let mut child_ctx = ExecutionContext::new(input).with_metadata(ctx.metadata().clone());
        let child_outcome = self
            .run_chain(child.clone(), Entry::Start, &mut child_ctx, run, scope.child())
            .await;

        match child_outcome {
            Ok(ChainOutcome::Suspended(mut suspension)) => {
                suspension.parents.insert(
                    0,
                    SuspendedFrame {
                        flow_code: flow.code().to_string(),
                        flow_version: flow.version(),
                        node_id: node.id().to_string(),
                        context: ctx.clone(),
                        depth: scope.depth,
                    },
                );
                Ok(NodeOutcome::Suspended(suspension))
            }
            other => complete_subprocess(node, settings, result, started, &child_ctx, other),
        }
    }

    fn visit_wait(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        ctx: &ExecutionContext,
        run: &mut RunState,
        scope: Scope,
    ) -> Result<NodeOutcome, FlowError> {
        if scope.in_loop {
            return Err(FlowError::SuspendInLoop {
                node_id: node.id().to_string(),
            });
        }

        let conversation_id = ctx
            .conversation_id()
            .ok_or_else(|| FlowError::MissingConversation {
                node_id: node.id().to_string(),
            })?
            .to_string();

        let mut result = VertexResult::new(node.id(), NodeType::Wait);
        result.log(format!("waiting on conversation {}", conversation_id));
        run.record(result);

        info!(
            execute_id = %run.execute_id,
            node_id = %node.id(),
            conversation_id = %conversation_id,
            depth = scope.depth,
            "Suspending at wait node"
        );

        Ok(NodeOutcome::Suspended(Suspension {
            conversation_id,
            flow_code: flow.code().to_string(),
            flow_version: flow.version(),
            node_id: node.id().to_string(),
            snapshot: ctx.clone(),
            parents: Vec::new(),
        }))
    }

    /// Persist the end state of a walk and build the caller's result
    async fn finish(
        &self,
        outcome: Result<ChainOutcome, FlowError>,
        ctx: ExecutionContext,
        run: RunState,
    ) -> Result<ExecutionResult, FlowError> {
        let RunState {
            execute_id,
            vertex_results,
            ..
        } = run;

        match outcome {
            Ok(ChainOutcome::Ended(output)) | Ok(ChainOutcome::Exhausted(output)) => {
                self.transition(&execute_id, &[ExecutionStatus::Running], ExecutionStatus::Success, None)
                    .await?;
                info!(
                    execute_id = %execute_id,
                    nodes = vertex_results.len(),
                    "Execution succeeded"
                );
                Ok(ExecutionResult::success(execute_id, ctx, output, vertex_results))
            }
            Ok(ChainOutcome::Suspended(suspension)) => {
                self.transition(&execute_id, &[ExecutionStatus::Running], ExecutionStatus::Suspended, None)
                    .await?;

                let message = WaitMessage::new(
                    execute_id.clone(),
                    suspension.conversation_id,
                    suspension.flow_code,
                    suspension.flow_version,
                    suspension.node_id,
                    suspension.snapshot,
                )
                .with_parents(suspension.parents);
                let message_id = message.id().to_string();
                if let Err(e) = self.waits.save(message).await {
                    let error = FlowError::from(e);
                    if let Err(e) = self
                        .logs
                        .transition_status(
                            &execute_id,
                            &[ExecutionStatus::Suspended],
                            ExecutionStatus::Failed,
                            Some(error.to_string()),
                        )
                        .await
                    {
                        warn!(execute_id = %execute_id, error = %e, "Failed to mark unsaved suspension");
                    }
                    warn!(execute_id = %execute_id, error = %error, "Wait message could not be saved");
                    return Err(error);
                }

                info!(
                    execute_id = %execute_id,
                    wait_message_id = %message_id,
                    "Execution suspended"
                );
                Ok(ExecutionResult::suspended(execute_id, ctx, vertex_results, message_id))
            }
            Err(FlowError::Cancelled) => {
                let error = FlowError::Cancelled;
                self.transition(
                    &execute_id,
                    &[ExecutionStatus::Running],
                    ExecutionStatus::Cancelled,
                    Some(error.to_string()),
                )
                .await?;
                Ok(ExecutionResult::stopped(
                    execute_id,
                    ExecutionStatus::Cancelled,
                    ctx,
                    vertex_results,
                    &error,
                ))
            }
            Err(error) if error.is_retryable() => {
                self.logs.record_error(&execute_id, error.to_string()).await?;
                warn!(
                    execute_id = %execute_id,
                    error = %error,
                    "Execution hit a transient failure, left running for retry"
                );
                Ok(ExecutionResult::stopped(
                    execute_id,
                    ExecutionStatus::Running,
                    ctx,
                    vertex_results,
                    &error,
                ))
            }
            Err(error @ (FlowError::Aborted { .. } | FlowError::Storage(_))) => {
                if let Err(e) = self
                    .logs
                    .transition_status(
                        &execute_id,
                        &[ExecutionStatus::Running],
                        ExecutionStatus::Failed,
                        Some(error.to_string()),
                    )
                    .await
                {
                    warn!(execute_id = %execute_id, error = %e, "Failed to mark aborted execution");
                }
                warn!(execute_id = %execute_id, error = %error, "Execution aborted");
                Err(error)
            }
            Err(error) => {
                self.transition(
                    &execute_id,
                    &[ExecutionStatus::Running],
                    ExecutionStatus::Failed,
                    Some(error.to_string()),
                )
                .await?;
                warn!(execute_id = %execute_id, error = %error, "Execution failed");
                Ok(ExecutionResult::stopped(
                    execute_id,
                    ExecutionStatus::Failed,
                    ctx,
                    vertex_results,
                    &error,
                ))
            }
        }
    }

    /// Continue a resumed execution after its wait node, unwinding back
    /// through the recorded parent frames
    async fn continue_after_wait(
        &self,
        flow: Arc<FlowDefinition>,
        message: WaitMessage,
        ctx: ExecutionContext,
        event: Value,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        let mut run = RunState::new(message.execute_id().clone(), options);
        let mut frames = message.parents().to_vec();
        let mut ctx = ctx;

        let mut wait_result = VertexResult::new(message.node_id(), NodeType::Wait);
        wait_result.log("resumed by conversation event");
        wait_result.succeed(event);
        let entry = Entry::Settle {
            node_id: message.node_id().to_string(),
            outcome: NodeOutcome::done(wait_result, None),
        };

        let mut outcome = self
            .run_chain(flow, entry, &mut ctx, &mut run, Scope::at_depth(frames.len()))
            .await;

        loop {
            if let Ok(ChainOutcome::Suspended(suspension)) = &mut outcome {
                let mut parents = std::mem::take(&mut frames);
                parents.append(&mut suspension.parents);
                suspension.parents = parents;
                break;
            }

            let Some(frame) = frames.pop() else {
                break;
            };

            let parent = self.load_flow(&frame.flow_code, Some(frame.flow_version)).await?;
            let node = find_node(&parent, &frame.node_id)?;
            let settings = node.subprocess().ok_or_else(|| missing_settings(node, "subprocess"))?;

            let child_ctx = ctx;
            let mut parent_ctx = frame.context;
            let result = VertexResult::new(node.id(), NodeType::Subprocess);

            outcome = match complete_subprocess(node, settings, result, Instant::now(), &child_ctx, outcome) {
                Ok(node_outcome) => {
                    let entry = Entry::Settle {
                        node_id: frame.node_id,
                        outcome: node_outcome,
                    };
                    self.run_chain(parent.clone(), entry, &mut parent_ctx, &mut run, Scope::at_depth(frame.depth))
                        .await
                }
                Err(e) => Err(e),
            };
            ctx = parent_ctx;
        }

        self.finish(outcome, ctx, run).await
    }
}

#[async_trait]
impl FlowEngine for FlowScheduler {
    fn validate(&self, flow: &FlowDefinition) -> Vec<ValidationError> {
        FlowValidator::new(&self.registry, self.config.validation_limits()).validate(flow)
    }

    async fn execute(
        &self,
        flow: Arc<FlowDefinition>,
        initial_context: ExecutionContext,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        let errors = self.validate(&flow);
        if !errors.is_empty() {
            warn!(flow_code = %flow.code(), errors = errors.len(), "Rejected invalid flow");
            return Err(FlowError::Validation(errors));
        }

        let execute_id = ExecuteId::generate();
        let log = ExecutionLog::new(
            execute_id.clone(),
            flow.code().as_str(),
            flow.version(),
            initial_context.clone(),
        );
        self.logs.create(log).await?;
        self.transition(&execute_id, &[ExecutionStatus::Pending], ExecutionStatus::Running, None)
            .await?;

        info!(
            execute_id = %execute_id,
            flow_code = %flow.code(),
            flow_version = flow.version(),
            "Execution started"
        );

        let mut ctx = initial_context;
        let mut run = RunState::new(execute_id, options);
        let outcome = self
            .run_chain(flow, Entry::Start, &mut ctx, &mut run, Scope::default())
            .await;

        self.finish(outcome, ctx, run).await
    }

    async fn resume(
        &self,
        conversation_id: &str,
        event: Value,
        options: ExecutionOptions,
    ) -> Result<Option<ExecutionResult>, FlowError> {
        let pending = self.waits.list_by_unhandled_conversation_id(conversation_id).await?;
        if pending.is_empty() {
            debug!(conversation_id = %conversation_id, "No pending wait for event");
            return Ok(None);
        }

        for message in pending {
            let flow = self
                .load_flow(message.flow_code(), Some(message.flow_version()))
                .await?;
            let node = find_node(&flow, message.node_id())?;

            let mut ctx = message.snapshot().clone();
            ctx.record_output(node.id(), event.clone());

            if let Some(condition) = node.wait().and_then(|w| w.resume_condition.as_ref()) {
                match condition.evaluate(&ctx) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(
                            wait_message_id = %message.id(),
                            "Event does not satisfy resume condition"
                        );
                        continue;
                    }
                    Err(e) => {
                        warn!(
                            wait_message_id = %message.id(),
                            error = %e,
                            "Resume condition could not be evaluated"
                        );
                        continue;
                    }
                }
            }

            if !self.waits.handled(message.id()).await? {
                debug!(wait_message_id = %message.id(), "Wait message already handled");
                continue;
            }

            let execute_id = message.execute_id().clone();
            let resumed = self
                .logs
                .transition_status(
                    &execute_id,
                    &[ExecutionStatus::Suspended],
                    ExecutionStatus::Running,
                    None,
                )
                .await?;
            if !resumed {
                let status = self
                    .logs
                    .get(&execute_id)
                    .await?
                    .map(|log| log.status().to_string())
                    .unwrap_or_else(|| "missing".to_string());
                return Err(FlowError::InvalidState {
                    execute_id: execute_id.to_string(),
                    status,
                    expected: ExecutionStatus::Suspended.to_string(),
                });
            }

            info!(
                execute_id = %execute_id,
                wait_message_id = %message.id(),
                conversation_id = %conversation_id,
                "Execution resumed"
            );

            let result = self
                .continue_after_wait(flow, message, ctx, event, options)
                .await?;
            return Ok(Some(result));
        }

        Ok(None)
    }

    async fn retry(
        &self,
        execute_id: &ExecuteId,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult, FlowError> {
        let log = self
            .logs
            .get(execute_id)
            .await?
            .ok_or_else(|| FlowError::ExecutionNotFound(execute_id.to_string()))?;

        if log.status() != ExecutionStatus::Running {
            return Err(FlowError::InvalidState {
                execute_id: execute_id.to_string(),
                status: log.status().to_string(),
                expected: ExecutionStatus::Running.to_string(),
            });
        }

        let flow = self
            .load_flow(log.flow_code(), Some(log.flow_version()))
            .await?;

        let (mut ctx, entry) = match log.checkpoint() {
            Some(checkpoint) => (
                checkpoint.context.clone(),
                Entry::After {
                    node_id: checkpoint.node_id.clone(),
                    label: checkpoint.label.clone(),
                },
            ),
            None => (log.initial_context().clone(), Entry::Start),
        };

        info!(
            execute_id = %execute_id,
            retry_count = log.retry_count(),
            checkpoint = ?log.checkpoint().map(|c| c.node_id.as_str()),
            "Retrying execution"
        );

        let mut run = RunState::new(execute_id.clone(), options);
        let outcome = self
            .run_chain(flow, entry, &mut ctx, &mut run, Scope::default())
            .await;

        self.finish(outcome, ctx, run).await
    }
}
