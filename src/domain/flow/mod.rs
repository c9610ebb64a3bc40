//! Flow domain module
//!
//! A flow is a versioned graph of typed nodes joined by edges. Node params
//! are [`ExpressionValue`]s: constants, or references into the output of an
//! earlier node with an optional transformation chain:
//!
//! - `${http.body.items}` - field of the `http` node output
//! - `${http.body.items}.count()` - with a transformation
//! - `${variables.total}` - flow variable written by a Variable Save node
//!
//! Selector, loop and wait nodes carry [`ConditionTree`]s, written either as
//! structured JSON or in the text form handled by the `dsl` module.

mod condition;
mod context;
mod dsl;
mod engine;
mod entity;
mod error;
mod expression;
mod node_types;
pub mod repository;
mod runner;
mod validation;
mod vertex;

pub use condition::{CompareOperator, ConditionTree, LogicOperator};
pub use context::{ExecutionContext, ExecutionMetadata, VARIABLES_NAMESPACE};
pub use dsl::{deserialize_condition, deserialize_optional_condition};
pub use engine::{ExecutionObserver, ExecutionOptions, ExecutionResult, FlowEngine};
pub use entity::{
    Edge, FlowCode, FlowDefinition, LoopSettings, Node, OnErrorAction, SelectorBranch,
    SubprocessSettings, WaitSettings, EDGE_BODY, EDGE_ELSE, EDGE_ERROR, MAX_CODE_LENGTH,
};
pub use error::{DslError, EvaluationError, FlowError, ResolutionError, ValidationError};
pub use expression::{stringify, ExpressionValue, Transformation, ValueKind};
pub use node_types::NodeType;
pub use repository::FlowRepository;
pub use runner::{NodeInvocation, NodeRunner, NodeRunnerRegistry};
pub use validation::{FlowValidator, ValidationLimits};
pub use vertex::{NodeError, VertexResult};

#[cfg(test)]
pub use engine::MockFlowEngine;
#[cfg(test)]
pub use repository::MockFlowRepository;
