//! Repository traits for execution state
//!
//! These are the only records shared between concurrent workers. Status
//! transitions and the `handled` flag are compare-and-set: implementations
//! must apply the check and the write atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::entity::{Checkpoint, ExecuteId, ExecutionLog, ExecutionStatus, PageRequest};
use super::wait_message::WaitMessage;
use crate::domain::error::DomainError;

#[cfg(test)]
use mockall::automock;

/// Repository for execution logs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExecutionLogRepository: Send + Sync + std::fmt::Debug {
    /// Insert a new log; conflicts if the id already exists
    async fn create(&self, log: ExecutionLog) -> Result<(), DomainError>;

    /// Get a log by execute id
    async fn get(&self, execute_id: &ExecuteId) -> Result<Option<ExecutionLog>, DomainError>;

    /// Move to `to` only if the current status is one of `from`
    ///
    /// Returns false when the log was in another status. `error` replaces
    /// the recorded error.
    async fn transition_status(
        &self,
        execute_id: &ExecuteId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool, DomainError>;

    /// Record an error without changing the status
    async fn record_error(&self, execute_id: &ExecuteId, error: String) -> Result<(), DomainError>;

    /// Persist the last completed main-path node
    async fn save_checkpoint(
        &self,
        execute_id: &ExecuteId,
        checkpoint: Checkpoint,
    ) -> Result<(), DomainError>;

    /// Increment the retry counter unless it already reached `max`
    ///
    /// Returns the new count, or None when the bound was reached.
    async fn increment_retry_count(
        &self,
        execute_id: &ExecuteId,
        max: u32,
    ) -> Result<Option<u32>, DomainError>;

    /// Running logs not updated since `older_than`, oldest first
    async fn get_running_timeout_list(
        &self,
        older_than: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Vec<ExecutionLog>, DomainError>;
}

/// Repository for wait messages
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WaitMessageRepository: Send + Sync + std::fmt::Debug {
    /// Store a new wait message
    async fn save(&self, message: WaitMessage) -> Result<(), DomainError>;

    /// Find a wait message by id
    async fn find(&self, id: &str) -> Result<Option<WaitMessage>, DomainError>;

    /// Mark a message handled; returns false if another caller already did
    async fn handled(&self, id: &str) -> Result<bool, DomainError>;

    /// Unhandled messages for a conversation, earliest created first
    async fn list_by_unhandled_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<WaitMessage>, DomainError>;
}
