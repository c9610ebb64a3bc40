//! Flow definition entity

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::condition::ConditionTree;
use super::dsl::{deserialize_condition, deserialize_optional_condition};
use super::error::ValidationError;
use super::expression::ExpressionValue;
use super::node_types::NodeType;

/// Maximum length for flow codes
pub const MAX_CODE_LENGTH: usize = 64;

/// Edge label entering a loop body
pub const EDGE_BODY: &str = "body";

/// Edge label taken by a selector when no branch matches
pub const EDGE_ELSE: &str = "else";

/// Edge label followed by a node declaring a fallback
pub const EDGE_ERROR: &str = "error";

static CODE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap());

/// Validated flow code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FlowCode(String);

impl FlowCode {
    pub fn new(code: impl Into<String>) -> Result<Self, ValidationError> {
        let code = code.into();
        if code.is_empty() || code.len() > MAX_CODE_LENGTH || !CODE_PATTERN.is_match(&code) {
            return Err(ValidationError::InvalidFlowCode(code));
        }
        Ok(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FlowCode {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FlowCode> for String {
    fn from(code: FlowCode) -> Self {
        code.0
    }
}

impl fmt::Display for FlowCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for FlowCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// What happens when a node fails
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorAction {
    /// Terminate the execution as failed
    #[default]
    Fail,

    /// Record the failure and follow the normal edge
    Continue,

    /// Follow the node's `error` edge
    Fallback,
}

/// One guarded branch of a selector node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectorBranch {
    /// Branch id, also the label of the edge taken when it matches
    pub id: String,

    #[serde(deserialize_with = "deserialize_condition")]
    pub condition: ConditionTree,
}

impl SelectorBranch {
    pub fn new(id: impl Into<String>, condition: ConditionTree) -> Self {
        Self {
            id: id.into(),
            condition,
        }
    }
}

/// Loop node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSettings {
    /// Collection to iterate; without one the loop runs until the break
    /// condition holds or the iteration guard is reached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ExpressionValue>,

    /// Iteration guard for this node
    pub max_iterations: u32,

    /// Checked before every iteration
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_condition"
    )]
    pub break_condition: Option<ConditionTree>,
}

impl LoopSettings {
    pub fn over(items: ExpressionValue, max_iterations: u32) -> Self {
        Self {
            items: Some(items),
            max_iterations,
            break_condition: None,
        }
    }

    pub fn with_break_condition(mut self, condition: ConditionTree) -> Self {
        self.break_condition = Some(condition);
        self
    }
}

/// Subprocess node settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessSettings {
    pub flow_code: String,

    /// Latest version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,

    /// Child node whose output becomes the subprocess output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_node: Option<String>,
}

impl SubprocessSettings {
    pub fn new(flow_code: impl Into<String>) -> Self {
        Self {
            flow_code: flow_code.into(),
            version: None,
            output_node: None,
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_output_node(mut self, node_id: impl Into<String>) -> Self {
        self.output_node = Some(node_id.into());
        self
    }
}

/// Wait node settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitSettings {
    /// Predicate over the inbound event (bound under the wait node's id);
    /// any event resumes when absent
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_optional_condition"
    )]
    pub resume_condition: Option<ConditionTree>,
}

/// A node of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,

    #[serde(rename = "type")]
    node_type: NodeType,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    params: BTreeMap<String, ExpressionValue>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    branches: Vec<SelectorBranch>,

    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    loop_settings: Option<LoopSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    subprocess: Option<SubprocessSettings>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait: Option<WaitSettings>,

    #[serde(default)]
    on_error: OnErrorAction,
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: id.into(),
            title: None,
            node_type,
            params: BTreeMap::new(),
            branches: Vec::new(),
            loop_settings: None,
            subprocess: None,
            wait: None,
            on_error: OnErrorAction::default(),
        }
    }

    // Builder methods

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: ExpressionValue) -> Self {
        self.params.insert(name.into(), value);
        self
    }

    pub fn with_branch(mut self, branch: SelectorBranch) -> Self {
        self.branches.push(branch);
        self
    }

    pub fn with_loop(mut self, settings: LoopSettings) -> Self {
        self.loop_settings = Some(settings);
        self
    }

    pub fn with_subprocess(mut self, settings: SubprocessSettings) -> Self {
        self.subprocess = Some(settings);
        self
    }

    pub fn with_wait(mut self, settings: WaitSettings) -> Self {
        self.wait = Some(settings);
        self
    }

    pub fn with_on_error(mut self, action: OnErrorAction) -> Self {
        self.on_error = action;
        self
    }

    // Getters

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn params(&self) -> &BTreeMap<String, ExpressionValue> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ExpressionValue> {
        self.params.get(name)
    }

    pub fn branches(&self) -> &[SelectorBranch] {
        &self.branches
    }

    pub fn loop_settings(&self) -> Option<&LoopSettings> {
        self.loop_settings.as_ref()
    }

    pub fn subprocess(&self) -> Option<&SubprocessSettings> {
        self.subprocess.as_ref()
    }

    pub fn wait(&self) -> Option<&WaitSettings> {
        self.wait.as_ref()
    }

    pub fn on_error(&self) -> OnErrorAction {
        self.on_error
    }

    /// Every condition tree declared on this node
    pub fn conditions(&self) -> Vec<&ConditionTree> {
        let mut conditions: Vec<&ConditionTree> =
            self.branches.iter().map(|b| &b.condition).collect();
        if let Some(cond) = self.loop_settings.as_ref().and_then(|l| l.break_condition.as_ref()) {
            conditions.push(cond);
        }
        if let Some(cond) = self.wait.as_ref().and_then(|w| w.resume_condition.as_ref()) {
            conditions.push(cond);
        }
        conditions
    }
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    source: String,

    target: String,

    /// Branch label; `None` for the normal path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: None,
        }
    }

    pub fn labelled(source: impl Into<String>, target: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            label: Some(label.into()),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn is_normal(&self) -> bool {
        self.label.is_none()
    }
}

fn default_version() -> u32 {
    1
}

/// A versioned flow graph, immutable once loaded for an execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    code: FlowCode,

    #[serde(default = "default_version")]
    version: u32,

    #[serde(default)]
    name: String,

    nodes: Vec<Node>,

    #[serde(default)]
    edges: Vec<Edge>,
}

impl FlowDefinition {
    pub fn new(code: FlowCode, name: impl Into<String>) -> Self {
        Self {
            code,
            version: 1,
            name: name.into(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    // Builder methods

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    // Getters

    pub fn code(&self) -> &FlowCode {
        &self.code
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// The first start node, if any
    pub fn start_node(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.node_type() == NodeType::Start)
    }

    /// Edges leaving `node_id`, in declaration order
    pub fn outgoing<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.source() == node_id)
    }

    /// Target of the unlabelled edge leaving `node_id`
    pub fn next_normal(&self, node_id: &str) -> Option<&str> {
        self.outgoing(node_id)
            .find(|e| e.is_normal())
            .map(|e| e.target())
    }

    /// Target of the edge leaving `node_id` with the given label
    pub fn next_labelled(&self, node_id: &str, label: &str) -> Option<&str> {
        self.outgoing(node_id)
            .find(|e| e.label() == Some(label))
            .map(|e| e.target())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flow::condition::CompareOperator;
    use serde_json::json;

    #[test]
    fn test_flow_code_valid() {
        assert!(FlowCode::new("onboarding").is_ok());
        assert!(FlowCode::new("order_status-v2").is_ok());
        assert!(FlowCode::new("a".repeat(64)).is_ok());
    }

    #[test]
    fn test_flow_code_invalid() {
        assert!(FlowCode::new("").is_err());
        assert!(FlowCode::new("has spaces").is_err());
        assert!(FlowCode::new("dots.not.allowed").is_err());
        assert_eq!(
            FlowCode::new("a".repeat(65)).unwrap_err(),
            ValidationError::InvalidFlowCode("a".repeat(65))
        );
    }

    #[test]
    fn test_flow_code_serialization() {
        let code = FlowCode::new("support").unwrap();
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"support\"");
        assert!(serde_json::from_str::<FlowCode>("\"bad code\"").is_err());
    }

    #[test]
    fn test_node_builder() {
        let node = Node::new("http", NodeType::HttpRequest)
            .with_title("Fetch order")
            .with_param("url", ExpressionValue::constant("https://example.com"))
            .with_on_error(OnErrorAction::Fallback);

        assert_eq!(node.id(), "http");
        assert_eq!(node.title(), Some("Fetch order"));
        assert_eq!(node.node_type(), NodeType::HttpRequest);
        assert!(node.param("url").is_some());
        assert_eq!(node.on_error(), OnErrorAction::Fallback);
    }

    #[test]
    fn test_edge_navigation() {
        let flow = FlowDefinition::new(FlowCode::new("nav").unwrap(), "Navigation")
            .with_node(Node::new("start", NodeType::Start))
            .with_node(Node::new("sel", NodeType::Selector))
            .with_node(Node::new("ok", NodeType::End))
            .with_node(Node::new("ko", NodeType::End))
            .with_edge(Edge::new("start", "sel"))
            .with_edge(Edge::labelled("sel", "ok", "success"))
            .with_edge(Edge::labelled("sel", "ko", EDGE_ELSE));

        assert_eq!(flow.start_node().map(|n| n.id()), Some("start"));
        assert_eq!(flow.next_normal("start"), Some("sel"));
        assert_eq!(flow.next_normal("sel"), None);
        assert_eq!(flow.next_labelled("sel", "success"), Some("ok"));
        assert_eq!(flow.next_labelled("sel", EDGE_ELSE), Some("ko"));
        assert_eq!(flow.outgoing("sel").count(), 2);
    }

    #[test]
    fn test_edge_targets_outlive_lookup_key() {
        let flow = FlowDefinition::new(FlowCode::new("nav").unwrap(), "Navigation")
            .with_node(Node::new("start", NodeType::Start))
            .with_node(Node::new("end", NodeType::End))
            .with_edge(Edge::new("start", "end"))
            .with_edge(Edge::labelled("start", "end", "error"));

        let (normal, labelled) = {
            let key = String::from("start");
            (flow.next_normal(&key), flow.next_labelled(&key, "error"))
        };
        assert_eq!(normal, Some("end"));
        assert_eq!(labelled, Some("end"));

        let edges: Vec<&Edge> = {
            let key = "start".to_string();
            flow.outgoing(&key).collect()
        };
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn test_flow_deserialization() {
        let flow: FlowDefinition = serde_json::from_value(json!({
            "code": "order-status",
            "name": "Order status",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "route", "type": "selector", "branches": [
                    {"id": "ok", "condition": "${start.status} == \"SUCCESS\""}
                ]},
                {"id": "each", "type": "loop", "loop": {
                    "items": {"kind": "expression", "path": "start.items"},
                    "max_iterations": 10,
                    "break_condition": "${each.index} >= 5"
                }},
                {"id": "later", "type": "sentiment_analysis"}
            ],
            "edges": [
                {"source": "start", "target": "route"},
                {"source": "route", "target": "each", "label": "ok"}
            ]
        }))
        .unwrap();

        assert_eq!(flow.version(), 1);
        assert_eq!(flow.nodes().len(), 4);

        let route = flow.node("route").unwrap();
        match &route.branches()[0].condition {
            ConditionTree::Compare { operator, .. } => assert_eq!(*operator, CompareOperator::Equal),
            other => panic!("unexpected condition {:?}", other),
        }

        let each = flow.node("each").unwrap();
        assert_eq!(each.loop_settings().unwrap().max_iterations, 10);
        assert_eq!(each.conditions().len(), 1);

        assert_eq!(flow.node("later").unwrap().node_type(), NodeType::Unknown);
    }
}
