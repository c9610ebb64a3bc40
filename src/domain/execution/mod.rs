//! Execution state shared across workers: the execution log and the wait
//! messages that park suspended executions.

mod entity;
pub mod repository;
mod wait_message;

pub use entity::{Checkpoint, ExecuteId, ExecutionLog, ExecutionStatus, PageRequest};
pub use repository::{ExecutionLogRepository, WaitMessageRepository};
pub use wait_message::{SuspendedFrame, WaitMessage};

#[cfg(test)]
pub use repository::{MockExecutionLogRepository, MockWaitMessageRepository};
