//! Load-time validation of flow definitions
//!
//! Collects every structural problem instead of stopping at the first one,
//! so authors see the full list in one pass.

use std::collections::{HashMap, HashSet, VecDeque};

use super::context::VARIABLES_NAMESPACE;
use super::entity::{EDGE_BODY, EDGE_ERROR, FlowDefinition, Node, OnErrorAction};
use super::error::ValidationError;
use super::node_types::NodeType;
use super::runner::NodeRunnerRegistry;

/// Bounds enforced at validation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationLimits {
    pub max_condition_depth: usize,
    pub max_loop_iterations: u32,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_condition_depth: 3,
            max_loop_iterations: 1000,
        }
    }
}

/// Validates flows against the registered runners
#[derive(Debug, Clone)]
pub struct FlowValidator<'a> {
    registry: &'a NodeRunnerRegistry,
    limits: ValidationLimits,
}

impl<'a> FlowValidator<'a> {
    pub fn new(registry: &'a NodeRunnerRegistry, limits: ValidationLimits) -> Self {
        Self { registry, limits }
    }

    pub fn validate(&self, flow: &FlowDefinition) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let ids = check_node_ids(flow, &mut errors);
        check_start(flow, &mut errors);

        for node in flow.nodes() {
            self.check_node(flow, node, &ids, &mut errors);
        }

        for edge in flow.edges() {
            if !ids.contains(edge.source()) || !ids.contains(edge.target()) {
                errors.push(ValidationError::DanglingEdge {
                    from: edge.source().to_string(),
                    to: edge.target().to_string(),
                });
            }
        }

        check_reachability(flow, &mut errors);
        check_cycles(flow, &mut errors);
        check_loop_bodies(flow, &mut errors);

        errors
    }

    fn check_node(
        &self,
        flow: &FlowDefinition,
        node: &Node,
        ids: &HashSet<&str>,
        errors: &mut Vec<ValidationError>,
    ) {
        let node_id = node.id().to_string();
        let node_type = node.node_type();

        if node_type == NodeType::Unknown {
            errors.push(ValidationError::UnknownNodeType { node_id });
            return;
        }

        if !self.registry.supports(node_type) {
            errors.push(ValidationError::UnregisteredNodeType {
                node_id,
                node_type: node_type.to_string(),
            });
            return;
        }

        for param in self.registry.required_params(node_type) {
            if node.param(param).is_none() {
                errors.push(ValidationError::MissingParam {
                    node_id: node_id.clone(),
                    param: param.to_string(),
                });
            }
        }

        match node_type {
            NodeType::Selector => {
                if node.branches().is_empty() {
                    errors.push(missing_settings(&node_id, "branches"));
                }
                for branch in node.branches() {
                    if flow.next_labelled(node.id(), &branch.id).is_none() {
                        errors.push(ValidationError::MissingBranchEdge {
                            node_id: node_id.clone(),
                            branch: branch.id.clone(),
                        });
                    }
                }
            }
            NodeType::Loop => match node.loop_settings() {
                None => errors.push(missing_settings(&node_id, "loop")),
                Some(settings) => {
                    let limit = self.limits.max_loop_iterations;
                    if settings.max_iterations == 0 || settings.max_iterations > limit {
                        errors.push(ValidationError::InvalidLoopBound {
                            node_id: node_id.clone(),
                            max_iterations: settings.max_iterations,
                            limit,
                        });
                    }
                    if flow.next_labelled(node.id(), EDGE_BODY).is_none() {
                        errors.push(ValidationError::MissingBranchEdge {
                            node_id: node_id.clone(),
                            branch: EDGE_BODY.to_string(),
                        });
                    }
                }
            },
            NodeType::Subprocess if node.subprocess().is_none() => {
                errors.push(missing_settings(&node_id, "subprocess"));
            }
            _ => {}
        }

        for condition in node.conditions() {
            let depth = condition.depth();
            if depth > self.limits.max_condition_depth {
                errors.push(ValidationError::ConditionTooDeep {
                    node_id: node_id.clone(),
                    depth,
                    max: self.limits.max_condition_depth,
                });
            }
            for operator in condition.misplaced_operands() {
                errors.push(ValidationError::MisplacedOperand {
                    node_id: node_id.clone(),
                    operator: operator.symbol().to_string(),
                });
            }
        }

        let expressions = node
            .params()
            .values()
            .chain(node.loop_settings().and_then(|l| l.items.as_ref()))
            .chain(node.conditions().into_iter().flat_map(|c| c.expressions()));
        for expression in expressions {
            if let Some(reference) = expression.referenced_node() {
                if reference != VARIABLES_NAMESPACE && !ids.contains(reference) {
                    errors.push(ValidationError::UnknownReference {
                        node_id: node_id.clone(),
                        reference: reference.to_string(),
                    });
                }
            }
        }

        if node.on_error() == OnErrorAction::Fallback
            && flow.next_labelled(node.id(), EDGE_ERROR).is_none()
        {
            errors.push(ValidationError::MissingFallbackEdge {
                node_id: node_id.clone(),
            });
        }

        let mut seen_labels = HashSet::new();
        let mut normal_edges = 0;
        for edge in flow.outgoing(node.id()) {
            let ambiguous = match edge.label() {
                None => {
                    normal_edges += 1;
                    normal_edges > 1
                }
                Some(label) => !seen_labels.insert(label),
            };
            if ambiguous {
                errors.push(ValidationError::AmbiguousEdges { node_id });
                break;
            }
        }
    }
}

fn missing_settings(node_id: &str, settings: &str) -> ValidationError {
    ValidationError::MissingSettings {
        node_id: node_id.to_string(),
        settings: settings.to_string(),
    }
}

fn check_node_ids<'f>(flow: &'f FlowDefinition, errors: &mut Vec<ValidationError>) -> HashSet<&'f str> {
    let mut ids = HashSet::new();
    for node in flow.nodes() {
        let id = node.id();
        if id == VARIABLES_NAMESPACE {
            errors.push(ValidationError::ReservedNodeId(id.to_string()));
        } else if id.is_empty() || id.contains('.') {
            errors.push(ValidationError::InvalidNodeId(id.to_string()));
        }
        if !ids.insert(id) {
            errors.push(ValidationError::DuplicateNodeId(id.to_string()));
        }
    }
    ids
}

fn check_start(flow: &FlowDefinition, errors: &mut Vec<ValidationError>) {
    let starts: Vec<String> = flow
        .nodes()
        .iter()
        .filter(|n| n.node_type() == NodeType::Start)
        .map(|n| n.id().to_string())
        .collect();

    match starts.len() {
        0 => errors.push(ValidationError::MissingStartNode),
        1 => {}
        _ => errors.push(ValidationError::MultipleStartNodes(starts)),
    }
}

fn adjacency(flow: &FlowDefinition) -> HashMap<&str, Vec<&str>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in flow.edges() {
        adjacency.entry(edge.source()).or_default().push(edge.target());
    }
    adjacency
}

fn reachable_from<'f>(adjacency: &HashMap<&'f str, Vec<&'f str>>, root: &'f str) -> HashSet<&'f str> {
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        for &next in adjacency.get(current).into_iter().flatten() {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

fn check_reachability(flow: &FlowDefinition, errors: &mut Vec<ValidationError>) {
    let Some(start) = flow.start_node() else {
        return;
    };
    let reachable = reachable_from(&adjacency(flow), start.id());

    for node in flow.nodes() {
        if !reachable.contains(node.id()) {
            errors.push(ValidationError::UnreachableNode {
                node_id: node.id().to_string(),
            });
        }
    }
}

/// Iterative three-color DFS over every edge
fn check_cycles(flow: &FlowDefinition, errors: &mut Vec<ValidationError>) {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Active,
        Done,
    }

    let adjacency = adjacency(flow);
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for node in flow.nodes() {
        if marks.contains_key(node.id()) {
            continue;
        }

        let mut stack: Vec<(&str, usize)> = vec![(node.id(), 0)];
        marks.insert(node.id(), Mark::Active);

        while let Some((current, index)) = stack.pop() {
            let next = adjacency.get(current).and_then(|targets| targets.get(index));
            match next {
                Some(&target) => {
                    stack.push((current, index + 1));
                    match marks.get(target) {
                        Some(Mark::Active) => {
                            errors.push(ValidationError::Cycle {
                                node_id: target.to_string(),
                            });
                            return;
                        }
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(target, Mark::Active);
                            stack.push((target, 0));
                        }
                    }
                }
                None => {
                    marks.insert(current, Mark::Done);
                }
            }
        }
    }
}

fn check_loop_bodies(flow: &FlowDefinition, errors: &mut Vec<ValidationError>) {
    let adjacency = adjacency(flow);

    for node in flow.nodes().iter().filter(|n| n.node_type() == NodeType::Loop) {
        let Some(entry) = flow.next_labelled(node.id(), EDGE_BODY) else {
            continue;
        };

        let mut body: Vec<&str> = reachable_from(&adjacency, entry).into_iter().collect();
        body.sort();
        for id in body {
            if let Some(body_node) = flow.node(id) {
                if body_node.node_type() == NodeType::Wait {
                    errors.push(ValidationError::WaitInsideLoop {
                        node_id: id.to_string(),
                    });
                }
            }
        }
    }
}
