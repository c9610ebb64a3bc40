//! Per-execution context
//!
//! Holds the immutable output recorded for every completed node, keyed by
//! node id, plus the flow variables written by Variable Save nodes. Paths
//! are dot-separated: the first segment names a node (or the reserved
//! `variables` namespace), the remaining segments walk into objects by key
//! and into arrays by index.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::ResolutionError;

/// Path head that resolves into the flow variables
pub const VARIABLES_NAMESPACE: &str = "variables";

/// Isolation metadata threaded through an execution, opaque to the engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl ExecutionMetadata {
    pub fn with_organization_code(mut self, code: impl Into<String>) -> Self {
        self.organization_code = Some(code.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// Mutable state owned by exactly one in-flight execution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Initial input the execution was started with
    input: Value,

    /// Output of each completed node
    #[serde(default)]
    node_outputs: BTreeMap<String, Value>,

    /// Flow variables
    #[serde(default)]
    variables: Map<String, Value>,

    #[serde(default)]
    metadata: ExecutionMetadata,
}

impl ExecutionContext {
    /// Create a new context with the given input
    pub fn new(input: Value) -> Self {
        Self {
            input,
            ..Default::default()
        }
    }

    /// Set the isolation metadata
    pub fn with_metadata(mut self, metadata: ExecutionMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Get the initial input
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Get the isolation metadata
    pub fn metadata(&self) -> &ExecutionMetadata {
        &self.metadata
    }

    /// Get the conversation id, if the execution belongs to one
    pub fn conversation_id(&self) -> Option<&str> {
        self.metadata.conversation_id.as_deref()
    }

    /// Get every recorded node output
    pub fn node_outputs(&self) -> &BTreeMap<String, Value> {
        &self.node_outputs
    }

    /// Get the output of a specific node
    pub fn node_output(&self, node_id: &str) -> Option<&Value> {
        self.node_outputs.get(node_id)
    }

    /// Record the output of a completed node, replacing any earlier visit
    pub fn record_output(&mut self, node_id: impl Into<String>, output: Value) {
        self.node_outputs.insert(node_id.into(), output);
    }

    /// Get the flow variables
    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// Get a single flow variable
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Set a flow variable, replacing any earlier value
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.variables.insert(name.into(), value);
    }

    /// Look up a dotted path
    pub fn lookup(&self, path: &str) -> Result<&Value, ResolutionError> {
        let not_found = || ResolutionError::field_not_found(path);
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        if head == VARIABLES_NAMESPACE {
            let rest = rest.ok_or_else(not_found)?;
            let (name, field) = match rest.split_once('.') {
                Some((name, field)) => (name, Some(field)),
                None => (rest, None),
            };
            let root = self.variables.get(name).ok_or_else(not_found)?;
            return match field {
                Some(field) => get_nested_field(root, field).ok_or_else(not_found),
                None => Ok(root),
            };
        }

        let root = self.node_outputs.get(head).ok_or_else(not_found)?;
        match rest {
            Some(field) => get_nested_field(root, field).ok_or_else(not_found),
            None => Ok(root),
        }
    }
}

/// Walk a dotted path through objects and arrays
fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;

    for part in path.split('.') {
        match current {
            Value::Object(obj) => {
                current = obj.get(part)?;
            }
            Value::Array(arr) => {
                let index: usize = part.parse().ok()?;
                current = arr.get(index)?;
            }
            _ => return None,
        }
    }

    Some(current)
}
