//! In-memory execution state repositories

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::execution::{
    Checkpoint, ExecuteId, ExecutionLog, ExecutionLogRepository, ExecutionStatus, PageRequest,
    WaitMessage, WaitMessageRepository,
};
use crate::domain::DomainError;

/// In-memory implementation of ExecutionLogRepository
///
/// Every compare-and-set runs under the write lock.
#[derive(Debug, Default)]
pub struct InMemoryExecutionLogRepository {
    logs: Arc<RwLock<HashMap<ExecuteId, ExecutionLog>>>,
}

impl InMemoryExecutionLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a repository pre-populated with logs
    pub fn with_logs(logs: Vec<ExecutionLog>) -> Self {
        let map = logs
            .into_iter()
            .map(|log| (log.execute_id().clone(), log))
            .collect();

        Self {
            logs: Arc::new(RwLock::new(map)),
        }
    }
}

fn missing_log(execute_id: &ExecuteId) -> DomainError {
    DomainError::not_found(format!("Execution '{}' not found", execute_id))
}

#[async_trait]
impl ExecutionLogRepository for InMemoryExecutionLogRepository {
    async fn create(&self, log: ExecutionLog) -> Result<(), DomainError> {
        let mut logs = self.logs.write().await;

        if logs.contains_key(log.execute_id()) {
            return Err(DomainError::conflict(format!(
                "Execution '{}' already exists",
                log.execute_id()
            )));
        }

        logs.insert(log.execute_id().clone(), log);
        Ok(())
    }

    async fn get(&self, execute_id: &ExecuteId) -> Result<Option<ExecutionLog>, DomainError> {
        let logs = self.logs.read().await;
        Ok(logs.get(execute_id).cloned())
    }

    async fn transition_status(
        &self,
        execute_id: &ExecuteId,
        from: &[ExecutionStatus],
        to: ExecutionStatus,
        error: Option<String>,
    ) -> Result<bool, DomainError> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(execute_id)
            .ok_or_else(|| missing_log(execute_id))?;

        if !from.contains(&log.status()) {
            return Ok(false);
        }

        log.set_status(to);
        log.set_error(error);
        Ok(true)
    }

    async fn record_error(&self, execute_id: &ExecuteId, error: String) -> Result<(), DomainError> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(execute_id)
            .ok_or_else(|| missing_log(execute_id))?;

        log.set_error(Some(error));
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        execute_id: &ExecuteId,
        checkpoint: Checkpoint,
    ) -> Result<(), DomainError> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(execute_id)
            .ok_or_else(|| missing_log(execute_id))?;

        log.set_checkpoint(checkpoint);
        Ok(())
    }

    async fn increment_retry_count(
        &self,
        execute_id: &ExecuteId,
        max: u32,
    ) -> Result<Option<u32>, DomainError> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(execute_id)
            .ok_or_else(|| missing_log(execute_id))?;

        Ok(log.try_increment_retry(max))
    }

    async fn get_running_timeout_list(
        &self,
        older_than: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Vec<ExecutionLog>, DomainError> {
        let logs = self.logs.read().await;

        let mut stale: Vec<&ExecutionLog> = logs
            .values()
            .filter(|log| log.status() == ExecutionStatus::Running && log.updated_at() < older_than)
            .collect();
        stale.sort_by(|a, b| {
            a.updated_at()
                .cmp(&b.updated_at())
                .then_with(|| a.execute_id().cmp(b.execute_id()))
        });

        Ok(stale
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
struct WaitStore {
    messages: HashMap<String, (u64, WaitMessage)>,
    next_seq: u64,
}

/// In-memory implementation of WaitMessageRepository
#[derive(Debug, Default)]
pub struct InMemoryWaitMessageRepository {
    store: Arc<RwLock<WaitStore>>,
}

impl InMemoryWaitMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WaitMessageRepository for InMemoryWaitMessageRepository {
    async fn save(&self, message: WaitMessage) -> Result<(), DomainError> {
        let mut store = self.store.write().await;

        if store.messages.contains_key(message.id()) {
            return Err(DomainError::conflict(format!(
                "Wait message '{}' already exists",
                message.id()
            )));
        }

        let seq = store.next_seq;
        store.next_seq += 1;
        store
            .messages
            .insert(message.id().to_string(), (seq, message));
        Ok(())
    }

    async fn find(&self, id: &str) -> Result<Option<WaitMessage>, DomainError> {
        let store = self.store.read().await;
        Ok(store.messages.get(id).map(|(_, message)| message.clone()))
    }

    async fn handled(&self, id: &str) -> Result<bool, DomainError> {
        let mut store = self.store.write().await;
        let (_, message) = store
            .messages
            .get_mut(id)
            .ok_or_else(|| DomainError::not_found(format!("Wait message '{}' not found", id)))?;

        Ok(message.mark_handled())
    }

    async fn list_by_unhandled_conversation_id(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<WaitMessage>, DomainError> {
        let store = self.store.read().await;

        let mut pending: Vec<&(u64, WaitMessage)> = store
            .messages
            .values()
            .filter(|(_, m)| !m.is_handled() && m.conversation_id() == conversation_id)
            .collect();
        pending.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at().cmp(&b.created_at()).then(seq_a.cmp(seq_b))
        });

        Ok(pending.into_iter().map(|(_, m)| m.clone()).collect())
    }
}
