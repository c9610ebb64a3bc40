//! Retry/timeout sweep over stale running executions

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::domain::execution::{ExecuteId, ExecutionLogRepository, ExecutionStatus, PageRequest};
use crate::domain::flow::{ExecutionOptions, FlowEngine, FlowError};

/// What one sweep did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Executions re-driven from their checkpoint
    pub retried: Vec<ExecuteId>,

    /// Executions that ran out of retries and were marked failed
    pub timed_out: Vec<ExecuteId>,

    pub errors: Vec<(ExecuteId, String)>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.retried.is_empty() && self.timed_out.is_empty() && self.errors.is_empty()
    }
}

/// Finds running executions that stopped making progress and either
/// re-drives them or fails them once `max_retries` is spent
#[derive(Debug, Clone)]
pub struct TimeoutMonitor {
    engine: Arc<dyn FlowEngine>,
    logs: Arc<dyn ExecutionLogRepository>,
    config: EngineConfig,
}

impl TimeoutMonitor {
    pub fn new(
        engine: Arc<dyn FlowEngine>,
        logs: Arc<dyn ExecutionLogRepository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            engine,
            logs,
            config,
        }
    }

    fn cutoff(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.config.sweep_timeout())
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Run one sweep
    ///
    /// Candidates are collected before any of them is handled, since a
    /// retry touches `updated_at` and would shift the pages.
    pub async fn sweep(&self) -> Result<SweepReport, FlowError> {
        let older_than = self.cutoff();
        let page_size = self.config.sweep_page_size.max(1);

        let mut candidates = Vec::new();
        let mut page = PageRequest::first(page_size);
        loop {
            let logs = self.logs.get_running_timeout_list(older_than, page).await?;
            let count = logs.len();
            candidates.extend(logs.into_iter().map(|log| log.execute_id().clone()));
            if count < page_size {
                break;
            }
            page = page.next();
        }

        let mut report = SweepReport::default();
        if candidates.is_empty() {
            debug!("Sweep found no stale executions");
            return Ok(report);
        }

        info!(
            candidates = candidates.len(),
            older_than = %older_than,
            "Sweeping stale executions"
        );

        for execute_id in candidates {
            if let Err(e) = self.handle(&execute_id, &mut report).await {
                warn!(execute_id = %execute_id, error = %e, "Sweep failed for execution");
                report.errors.push((execute_id, e.to_string()));
            }
        }

        Ok(report)
    }

    async fn handle(&self, execute_id: &ExecuteId, report: &mut SweepReport) -> Result<(), FlowError> {
        let max = self.config.max_retries;

        match self.logs.increment_retry_count(execute_id, max).await? {
            Some(attempt) => {
                info!(execute_id = %execute_id, attempt, max, "Retrying stale execution");
                let result = self.engine.retry(execute_id, ExecutionOptions::default()).await?;
                debug!(execute_id = %execute_id, status = %result.status, "Retry finished");
                report.retried.push(execute_id.clone());
            }
            None => {
                let error = FlowError::Timeout {
                    execute_id: execute_id.to_string(),
                    retries: max,
                };
                let failed = self
                    .logs
                    .transition_status(
                        execute_id,
                        &[ExecutionStatus::Running],
                        ExecutionStatus::Failed,
                        Some(error.to_string()),
                    )
                    .await?;

                if failed {
                    warn!(execute_id = %execute_id, retries = max, "Execution timed out");
                    report.timed_out.push(execute_id.clone());
                } else {
                    debug!(execute_id = %execute_id, "Execution left running state before timeout");
                }
            }
        }

        Ok(())
    }

    /// Sweep every `interval` until `shutdown` is cancelled
    pub fn spawn(self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Timeout monitor stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        match self.sweep().await {
                            Ok(report) if !report.is_empty() => info!(
                                retried = report.retried.len(),
                                timed_out = report.timed_out.len(),
                                errors = report.errors.len(),
                                "Sweep finished"
                            ),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Sweep failed"),
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainError;
    use crate::domain::execution::{ExecutionLog, MockExecutionLogRepository};
    use crate::domain::flow::{ExecutionContext, ExecutionResult, MockFlowEngine};

    fn running_log(id: &str) -> ExecutionLog {
        let mut log = ExecutionLog::new(ExecuteId::new(id), "support", 1, ExecutionContext::default());
        log.set_status(ExecutionStatus::Running);
        log
    }

    fn config(page_size: usize) -> EngineConfig {
        EngineConfig {
            max_retries: 2,
            sweep_page_size: page_size,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sweep_retries_below_max() {
        let mut logs = MockExecutionLogRepository::new();
        logs.expect_get_running_timeout_list()
            .returning(|_, _| Ok(vec![running_log("exec-1")]));
        logs.expect_increment_retry_count()
            .withf(|id, max| id.as_str() == "exec-1" && *max == 2)
            .returning(|_, _| Ok(Some(1)));

        let mut engine = MockFlowEngine::new();
        engine
            .expect_retry()
            .withf(|id, _| id.as_str() == "exec-1")
            .times(1)
            .returning(|id, _| {
                Ok(ExecutionResult::success(
                    id.clone(),
                    ExecutionContext::default(),
                    serde_json::Value::Null,
                    vec![],
                ))
            });

        let monitor = TimeoutMonitor::new(Arc::new(engine), Arc::new(logs), config(10));
        let report = monitor.sweep().await.unwrap();

        assert_eq!(report.retried, vec![ExecuteId::new("exec-1")]);
        assert!(report.timed_out.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_fails_execution_at_max() {
        let mut logs = MockExecutionLogRepository::new();
        logs.expect_get_running_timeout_list()
            .returning(|_, _| Ok(vec![running_log("exec-1")]));
        logs.expect_increment_retry_count().returning(|_, _| Ok(None));
        logs.expect_transition_status()
            .withf(|id, from, to, error| {
                id.as_str() == "exec-1"
                    && from == [ExecutionStatus::Running]
                    && *to == ExecutionStatus::Failed
                    && error.as_deref() == Some("Execution 'exec-1' timed out after 2 retries")
            })
            .times(1)
            .returning(|_, _, _, _| Ok(true));

        let mut engine = MockFlowEngine::new();
        engine.expect_retry().never();

        let monitor = TimeoutMonitor::new(Arc::new(engine), Arc::new(logs), config(10));
        let report = monitor.sweep().await.unwrap();

        assert!(report.retried.is_empty());
        assert_eq!(report.timed_out, vec![ExecuteId::new("exec-1")]);
    }

    #[tokio::test]
    async fn test_sweep_collects_every_page() {
        let mut logs = MockExecutionLogRepository::new();
        logs.expect_get_running_timeout_list()
            .returning(|_, page| {
                let all = ["exec-1", "exec-2", "exec-3"];
                Ok(all
                    .iter()
                    .skip(page.offset)
                    .take(page.limit)
                    .map(|id| running_log(id))
                    .collect())
            });
        logs.expect_increment_retry_count().returning(|_, _| Ok(Some(1)));

        let mut engine = MockFlowEngine::new();
        engine.expect_retry().times(3).returning(|id, _| {
            Ok(ExecutionResult::success(
                id.clone(),
                ExecutionContext::default(),
                serde_json::Value::Null,
                vec![],
            ))
        });

        let monitor = TimeoutMonitor::new(Arc::new(engine), Arc::new(logs), config(2));
        let report = monitor.sweep().await.unwrap();

        assert_eq!(report.retried.len(), 3);
        assert_eq!(report.retried[2], ExecuteId::new("exec-3"));
    }

    #[tokio::test]
    async fn test_per_execution_errors_do_not_stop_sweep() {
        let mut logs = MockExecutionLogRepository::new();
        logs.expect_get_running_timeout_list()
            .returning(|_, _| Ok(vec![running_log("exec-1"), running_log("exec-2")]));
        logs.expect_increment_retry_count()
            .withf(|id, _| id.as_str() == "exec-1")
            .returning(|_, _| Err(DomainError::storage("lock timeout")));
        logs.expect_increment_retry_count()
            .withf(|id, _| id.as_str() == "exec-2")
            .returning(|_, _| Ok(Some(2)));

        let mut engine = MockFlowEngine::new();
        engine.expect_retry().times(1).returning(|id, _| {
            Ok(ExecutionResult::success(
                id.clone(),
                ExecutionContext::default(),
                serde_json::Value::Null,
                vec![],
            ))
        });

        let monitor = TimeoutMonitor::new(Arc::new(engine), Arc::new(logs), config(10));
        let report = monitor.sweep().await.unwrap();

        assert_eq!(report.retried, vec![ExecuteId::new("exec-2")]);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].0, ExecuteId::new("exec-1"));
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_shutdown() {
        let mut logs = MockExecutionLogRepository::new();
        logs.expect_get_running_timeout_list().returning(|_, _| Ok(vec![]));

        let monitor = TimeoutMonitor::new(Arc::new(MockFlowEngine::new()), Arc::new(logs), config(10));
        let shutdown = CancellationToken::new();
        let handle = monitor.spawn(Duration::from_millis(10), shutdown.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
