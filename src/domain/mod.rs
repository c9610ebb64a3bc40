//! Domain layer - Flow model, execution state and the contracts the engine
//! depends on

pub mod error;
pub mod execution;
pub mod flow;

pub use error::DomainError;
pub use execution::{
    Checkpoint, ExecuteId, ExecutionLog, ExecutionLogRepository, ExecutionStatus, PageRequest,
    SuspendedFrame, WaitMessage, WaitMessageRepository,
};
pub use flow::{
    ConditionTree, ExecutionContext, ExecutionOptions, ExecutionResult, ExpressionValue,
    FlowDefinition, FlowEngine, FlowError, FlowRepository, Node, NodeRunner, NodeRunnerRegistry,
    NodeType, ValidationError, VertexResult,
};
