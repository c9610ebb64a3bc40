//! Execution log entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::flow::ExecutionContext;

/// Identifier of one top-level execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecuteId(String);

impl ExecuteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("exec-{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExecuteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Execution status
///
/// `Pending -> Running -> {Success | Failed | Suspended | Cancelled}`;
/// `Suspended` re-enters `Running` on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Suspended,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Suspended => "suspended",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last completed main-path node and the context right after it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub node_id: String,

    /// Label of the edge taken out of the node; None for the normal edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    pub context: ExecutionContext,
}

impl Checkpoint {
    pub fn new(node_id: impl Into<String>, context: ExecutionContext) -> Self {
        Self {
            node_id: node_id.into(),
            label: None,
            context,
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }
}

/// Offset/limit paging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(&self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// One row per top-level execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLog {
    execute_id: ExecuteId,
    flow_code: String,
    flow_version: u32,
    status: ExecutionStatus,
    retry_count: u32,

    /// Context the execution was started with
    initial_context: ExecutionContext,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    checkpoint: Option<Checkpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,

    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl ExecutionLog {
    /// New pending log
    pub fn new(
        execute_id: ExecuteId,
        flow_code: impl Into<String>,
        flow_version: u32,
        initial_context: ExecutionContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            execute_id,
            flow_code: flow_code.into(),
            flow_version,
            status: ExecutionStatus::Pending,
            retry_count: 0,
            initial_context,
            checkpoint: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    // Getters

    /// Get the execution id
    pub fn execute_id(&self) -> &ExecuteId {
        &self.execute_id
    }

    /// Get the code of the flow being executed
    pub fn flow_code(&self) -> &str {
        &self.flow_code
    }

    /// Get the version of the flow being executed
    pub fn flow_version(&self) -> u32 {
        self.flow_version
    }

    /// Get the current status
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// Get the number of sweep retries so far
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn initial_context(&self) -> &ExecutionContext {
        &self.initial_context
    }

    /// Get the last saved checkpoint
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    /// Get the most recent error message
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get the time of the last change
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    // Mutators used by repositories; each one touches `updated_at`

    pub fn set_status(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.touch();
    }

    pub fn set_error(&mut self, error: Option<String>) {
        self.error = error;
        self.touch();
    }

    pub fn set_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoint = Some(checkpoint);
        self.touch();
    }

    /// Increment the retry counter unless it already reached `max`
    pub fn try_increment_retry(&mut self, max: u32) -> Option<u32> {
        if self.retry_count >= max {
            return None;
        }
        self.retry_count += 1;
        self.touch();
        Some(self.retry_count)
    }

    /// Test hook for aging a log past the sweep threshold
    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn log() -> ExecutionLog {
        ExecutionLog::new(ExecuteId::new("exec-1"), "support", 1, ExecutionContext::new(json!({})))
    }

    #[test]
    fn test_new_log_is_pending() {
        let log = log();
        assert_eq!(log.status(), ExecutionStatus::Pending);
        assert_eq!(log.retry_count(), 0);
        assert!(log.checkpoint().is_none());
        assert_eq!(log.started_at(), log.updated_at());
    }

    #[test]
    fn test_execute_id_generation() {
        let a = ExecuteId::generate();
        let b = ExecuteId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("exec-"));
    }

    #[test]
    fn test_status_classification() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(!ExecutionStatus::Suspended.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert_eq!(ExecutionStatus::Suspended.to_string(), "suspended");
    }

    #[test]
    fn test_retry_increment_is_bounded() {
        let mut log = log();
        assert_eq!(log.try_increment_retry(2), Some(1));
        assert_eq!(log.try_increment_retry(2), Some(2));
        assert_eq!(log.try_increment_retry(2), None);
        assert_eq!(log.retry_count(), 2);
    }

    #[test]
    fn test_mutation_touches_timestamp() {
        let mut log = log().with_updated_at(Utc::now() - chrono::Duration::hours(1));
        let before = log.updated_at();
        log.set_status(ExecutionStatus::Running);
        assert!(log.updated_at() > before);
    }

    #[test]
    fn test_page_request() {
        let page = PageRequest::first(50);
        assert_eq!(page.next(), PageRequest::new(50, 50));
    }
}
