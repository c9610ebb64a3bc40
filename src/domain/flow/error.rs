//! Flow error types

use thiserror::Error;

use crate::domain::DomainError;

/// Failure to materialize an expression against the execution context
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolutionError {
    #[error("Field not found: {path}")]
    FieldNotFound { path: String },

    #[error("Transform '{transform}' is not defined for {value_type}{}", detail_suffix(.detail))]
    IncompatibleTransform {
        transform: String,
        value_type: String,
        detail: Option<String>,
    },
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_ref()
        .map(|d| format!(" ({})", d))
        .unwrap_or_default()
}

impl ResolutionError {
    pub fn field_not_found(path: impl Into<String>) -> Self {
        Self::FieldNotFound { path: path.into() }
    }

    pub fn incompatible(transform: impl Into<String>, value_type: impl Into<String>) -> Self {
        Self::IncompatibleTransform {
            transform: transform.into(),
            value_type: value_type.into(),
            detail: None,
        }
    }

    pub fn conversion(
        transform: impl Into<String>,
        value_type: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self::IncompatibleTransform {
            transform: transform.into(),
            value_type: value_type.into(),
            detail: Some(detail.into()),
        }
    }
}

/// Failure while evaluating a condition tree or choosing a branch
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EvaluationError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Operator '{operator}' requires numeric operands, got {value}")]
    NonNumericOperand { operator: String, value: String },

    #[error("Operator '{operator}' cannot compare {left_type} with {right_type}")]
    IncompatibleOperands {
        operator: String,
        left_type: String,
        right_type: String,
    },

    #[error("No branch matched in node '{node_id}'")]
    NoBranchMatched { node_id: String },
}

impl EvaluationError {
    pub fn no_branch_matched(node_id: impl Into<String>) -> Self {
        Self::NoBranchMatched {
            node_id: node_id.into(),
        }
    }
}

/// Syntax error in the condition/expression DSL
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message} at offset {position}")]
pub struct DslError {
    pub message: String,
    pub position: usize,
}

impl DslError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

/// Structural problem found while loading a flow; never retried
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("Invalid flow code '{0}'")]
    InvalidFlowCode(String),

    #[error("Duplicate node id '{0}'")]
    DuplicateNodeId(String),

    #[error("Node id '{0}' is reserved")]
    ReservedNodeId(String),

    #[error("Node id '{0}' must be non-empty and contain no dots")]
    InvalidNodeId(String),

    #[error("Node '{node_id}' references unknown node '{reference}'")]
    UnknownReference { node_id: String, reference: String },

    #[error("Flow has no start node")]
    MissingStartNode,

    #[error("Flow has more than one start node: {}", .0.join(", "))]
    MultipleStartNodes(Vec<String>),

    #[error("Node '{node_id}' has an unknown type")]
    UnknownNodeType { node_id: String },

    #[error("Node '{node_id}' has type '{node_type}' with no registered runner")]
    UnregisteredNodeType { node_id: String, node_type: String },

    #[error("Node '{node_id}' is missing required param '{param}'")]
    MissingParam { node_id: String, param: String },

    #[error("Node '{node_id}' is missing its '{settings}' settings")]
    MissingSettings { node_id: String, settings: String },

    #[error("Condition in node '{node_id}' has depth {depth}, maximum is {max}")]
    ConditionTooDeep {
        node_id: String,
        depth: usize,
        max: usize,
    },

    #[error("Condition in node '{node_id}' uses '{operator}' with the wrong number of operands")]
    MisplacedOperand { node_id: String, operator: String },

    #[error("Edge '{from}' -> '{to}' references an unknown node")]
    DanglingEdge { from: String, to: String },

    #[error("Node '{node_id}' has more than one outgoing edge for the same path")]
    AmbiguousEdges { node_id: String },

    #[error("Node '{node_id}' has no edge for branch '{branch}'")]
    MissingBranchEdge { node_id: String, branch: String },

    #[error("Node '{node_id}' declares a fallback but has no 'error' edge")]
    MissingFallbackEdge { node_id: String },

    #[error("Node '{node_id}' is unreachable from the start node")]
    UnreachableNode { node_id: String },

    #[error("Cycle detected through node '{node_id}'")]
    Cycle { node_id: String },

    #[error("Loop '{node_id}' max_iterations {max_iterations} must be between 1 and {limit}")]
    InvalidLoopBound {
        node_id: String,
        max_iterations: u32,
        limit: u32,
    },

    #[error("Wait node '{node_id}' cannot be placed inside a loop body")]
    WaitInsideLoop { node_id: String },
}

/// Errors returned by the flow engine
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FlowError {
    #[error("Flow validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),

    #[error("Node '{node_id}' failed: {message}")]
    NodeFailed {
        node_id: String,
        message: String,
        retryable: bool,
    },

    #[error("Evaluation failed in node '{node_id}': {error}")]
    Evaluation {
        node_id: String,
        error: EvaluationError,
    },

    #[error("Runner aborted execution in node '{node_id}': {message}")]
    Aborted { node_id: String, message: String },

    #[error("Flow not found: {code}{}", version_suffix(.version))]
    FlowNotFound { code: String, version: Option<u32> },

    #[error("Subprocess '{node_id}' exceeds maximum call depth of {max}")]
    SubprocessDepthExceeded { node_id: String, max: usize },

    #[error("Wait node '{node_id}' cannot suspend inside a loop body")]
    SuspendInLoop { node_id: String },

    #[error("Wait node '{node_id}' reached without a conversation id")]
    MissingConversation { node_id: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Execution '{execute_id}' timed out after {retries} retries")]
    Timeout { execute_id: String, retries: u32 },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution '{execute_id}' is {status}, expected {expected}")]
    InvalidState {
        execute_id: String,
        status: String,
        expected: String,
    },

    #[error(transparent)]
    Storage(#[from] DomainError),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn version_suffix(version: &Option<u32>) -> String {
    version.map(|v| format!(" (version {})", v)).unwrap_or_default()
}

impl FlowError {
    pub fn node_failed(node_id: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::NodeFailed {
            node_id: node_id.into(),
            message: message.into(),
            retryable,
        }
    }

    pub fn evaluation(node_id: impl Into<String>, error: EvaluationError) -> Self {
        Self::Evaluation {
            node_id: node_id.into(),
            error,
        }
    }

    pub fn aborted(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Aborted {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    pub fn flow_not_found(code: impl Into<String>, version: Option<u32>) -> Self {
        Self::FlowNotFound {
            code: code.into(),
            version,
        }
    }

    /// Only runner failures the runner itself classified as transient are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NodeFailed { retryable: true, .. })
    }

    /// Failures attributable to a single node, which its `on_error` policy
    /// may absorb
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::NodeFailed { .. }
                | Self::Evaluation { .. }
                | Self::FlowNotFound { .. }
                | Self::SubprocessDepthExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_display() {
        let err = ResolutionError::field_not_found("http.body.status");
        assert_eq!(err.to_string(), "Field not found: http.body.status");

        let err = ResolutionError::incompatible("count", "string");
        assert_eq!(err.to_string(), "Transform 'count' is not defined for string");

        let err = ResolutionError::conversion("toNumber", "string", "'abc' is not a number");
        assert_eq!(
            err.to_string(),
            "Transform 'toNumber' is not defined for string ('abc' is not a number)"
        );
    }

    #[test]
    fn test_evaluation_error_wraps_resolution() {
        let err: EvaluationError = ResolutionError::field_not_found("a.b").into();
        assert_eq!(err.to_string(), "Field not found: a.b");
        assert_eq!(
            EvaluationError::no_branch_matched("route").to_string(),
            "No branch matched in node 'route'"
        );
    }

    #[test]
    fn test_flow_error_display() {
        let err = FlowError::Validation(vec![
            ValidationError::MissingStartNode,
            ValidationError::DuplicateNodeId("a".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "Flow validation failed: Flow has no start node; Duplicate node id 'a'"
        );

        let err = FlowError::flow_not_found("child", Some(2));
        assert_eq!(err.to_string(), "Flow not found: child (version 2)");

        let err = FlowError::flow_not_found("child", None);
        assert_eq!(err.to_string(), "Flow not found: child");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(FlowError::node_failed("http", "503", true).is_retryable());
        assert!(!FlowError::node_failed("http", "404", false).is_retryable());
        assert!(!FlowError::evaluation("sel", EvaluationError::no_branch_matched("sel")).is_retryable());
        assert!(!FlowError::Validation(vec![]).is_retryable());
    }

    #[test]
    fn test_node_failure_classification() {
        assert!(FlowError::node_failed("http", "404", false).is_node_failure());
        assert!(FlowError::flow_not_found("child", None).is_node_failure());
        assert!(!FlowError::Cancelled.is_node_failure());
        assert!(!FlowError::aborted("llm", "out of memory").is_node_failure());
        assert!(!FlowError::Storage(DomainError::storage("down")).is_node_failure());
    }

    #[test]
    fn test_domain_error_conversion() {
        let err: FlowError = DomainError::storage("disk full").into();
        assert_eq!(err, FlowError::Storage(DomainError::storage("disk full")));
        assert_eq!(err.to_string(), "Storage error: disk full");
    }
}
