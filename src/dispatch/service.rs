use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

use super::callbacks::{EngineProgressCallback, EngineResumeCallback};
use super::registry::{TaskExecutorRegistry, TaskMode};
use crate::collaborators::{
    OrchestrationEngine, StepResponse, TaskExecutor, TaskRequest, WaitNotifyEngine,
};
use crate::config::DispatchConfig;
use crate::errors::{ExecutionError, ExecutionResult};
use crate::execution::{Ambiance, ExecutableResponse, NodeExecution, NodeExecutionService, Status};
use crate::observability::{engine_metrics, EngineMetrics};
use crate::store::NodeUpdate;
use crate::telemetry::create_node_span;

const DEFAULT_PICKUP_LIMIT: usize = 16;

/// Bridges nodes that need remote work to the executor for a task mode.
/// Never decides a node's next transition; that stays with the engine.
pub struct TaskDispatchService {
    node_service: Arc<NodeExecutionService>,
    engine: Arc<dyn OrchestrationEngine>,
    wait_notify: Arc<dyn WaitNotifyEngine>,
    executors: TaskExecutorRegistry,
    default_mode: TaskMode,
    pickups: Arc<Semaphore>,
    metrics: &'static EngineMetrics,
}

impl TaskDispatchService {
    pub fn new(
        node_service: Arc<NodeExecutionService>,
        engine: Arc<dyn OrchestrationEngine>,
        wait_notify: Arc<dyn WaitNotifyEngine>,
        executors: TaskExecutorRegistry,
    ) -> Self {
        Self {
            node_service,
            engine,
            wait_notify,
            executors,
            default_mode: TaskMode::Async,
            pickups: Arc::new(Semaphore::new(DEFAULT_PICKUP_LIMIT)),
            metrics: engine_metrics(),
        }
    }

    pub fn configured(mut self, config: &DispatchConfig) -> Self {
        self.default_mode = config.default_task_mode;
        self.with_pickup_limit(config.worker_threads_hint)
    }

    pub fn default_mode(&self) -> TaskMode {
        self.default_mode
    }

    /// Bound the number of engine pickups running at once
    pub fn with_pickup_limit(mut self, limit: usize) -> Self {
        self.pickups = Arc::new(Semaphore::new(limit.max(1)));
        self
    }

    pub fn node_service(&self) -> &Arc<NodeExecutionService> {
        &self.node_service
    }

    /// Persist a fresh node and schedule the engine to start it.
    ///
    /// Returns once the record is saved; the pickup runs on the shared
    /// runtime and its handle is only needed by callers that want to wait.
    pub async fn queue_node_execution(&self, record: NodeExecution) -> ExecutionResult<JoinHandle<()>> {
        let saved = self.node_service.save(record).await?;
        let span = create_node_span(
            "start_node_execution",
            &saved.plan_execution_id,
            Some(&saved.id),
        );

        let engine = Arc::clone(&self.engine);
        let pickups = Arc::clone(&self.pickups);
        let handle = tokio::spawn(
            async move {
                let Ok(_permit) = pickups.acquire_owned().await else {
                    warn!(node_execution_id = %saved.id, "Pickup pool closed, node not started");
                    return;
                };
                if let Err(e) = engine.start_node_execution(&saved.id, &saved.ambiance).await {
                    error!(node_execution_id = %saved.id, error = %e, "Engine failed to start node execution");
                }
            }
            .instrument(span),
        );
        Ok(handle)
    }

    /// `queue_task` with the configured default mode
    pub async fn queue_task_with_default_mode(
        &self,
        node_execution_id: &str,
        context: HashMap<String, String>,
        task: TaskRequest,
    ) -> ExecutionResult<String> {
        self.queue_task(node_execution_id, self.default_mode, context, task)
            .await
    }

    /// Submit `task` to the executor for `mode` and subscribe the owning
    /// node to its completion and progress. Returns the task id.
    ///
    /// If the subscriptions cannot be registered the task is aborted, since
    /// nothing would ever resume the node when it completes.
    pub async fn queue_task(
        &self,
        node_execution_id: &str,
        mode: TaskMode,
        context: HashMap<String, String>,
        task: TaskRequest,
    ) -> ExecutionResult<String> {
        let executor = self.executors.obtain(mode)?;
        let Some(task_id) = executor.queue_task(&context, &task).await? else {
            error!(
                node_execution_id = %node_execution_id,
                mode = %mode,
                task_name = %task.task_name,
                "Task executor returned no task id"
            );
            return Err(ExecutionError::TaskIdMissing {
                mode,
                node_execution_id: node_execution_id.to_string(),
            });
        };

        if let Err(source) = self.subscribe_task(node_execution_id, &task_id).await {
            error!(
                node_execution_id = %node_execution_id,
                task_id = %task_id,
                error = %source,
                "Could not subscribe to task, aborting it"
            );
            let aborted = self
                .abort_orphaned_task(executor.as_ref(), node_execution_id, &task_id)
                .await;
            return Err(ExecutionError::TaskSubscriptionFailed {
                task_id,
                node_execution_id: node_execution_id.to_string(),
                aborted,
                source,
            });
        }

        self.metrics.record_task_queued();
        info!(
            node_execution_id = %node_execution_id,
            task_id = %task_id,
            mode = %mode,
            "Task queued"
        );
        Ok(task_id)
    }

    async fn subscribe_task(&self, node_execution_id: &str, task_id: &str) -> anyhow::Result<()> {
        self.wait_notify
            .wait_for_all_on(
                Arc::new(EngineResumeCallback::new(node_execution_id, Arc::clone(&self.engine))),
                vec![task_id.to_string()],
            )
            .await?;
        self.wait_notify
            .subscribe_progress(
                Arc::new(EngineProgressCallback::new(
                    node_execution_id,
                    Arc::clone(&self.node_service),
                    Arc::clone(&self.engine),
                )),
                task_id.to_string(),
            )
            .await
    }

    async fn abort_orphaned_task(
        &self,
        executor: &dyn TaskExecutor,
        node_execution_id: &str,
        task_id: &str,
    ) -> bool {
        let ambiance = match self.node_service.get(node_execution_id).await {
            Ok(node) => node.ambiance,
            Err(e) => {
                warn!(node_execution_id = %node_execution_id, error = %e, "Node unreadable, task left running");
                return false;
            }
        };
        match executor.abort_task(&ambiance, task_id).await {
            Ok(aborted) => aborted,
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "Abort of orphaned task failed");
                false
            }
        }
    }

    /// Append a suspension record, moving the node into `status` when given.
    ///
    /// Non-empty `callback_ids` add a fan-in wait that resumes the node once
    /// all of them are done. Returns false when a guarded transition lost to
    /// a concurrent writer; nothing is registered in that case.
    pub async fn add_executable_response(
        &self,
        node_execution_id: &str,
        status: Option<Status>,
        response: ExecutableResponse,
        callback_ids: Vec<String>,
    ) -> ExecutionResult<bool> {
        let ops = NodeUpdate::new().push_executable_response(response);
        match status {
            Some(status) => {
                let updated = self
                    .node_service
                    .update_status_with_ops(node_execution_id, status, ops, None)
                    .await?;
                if updated.is_none() {
                    return Ok(false);
                }
            }
            None => {
                self.node_service.update(node_execution_id, ops).await?;
            }
        }

        if !callback_ids.is_empty() {
            self.wait_notify
                .wait_for_all_on(
                    Arc::new(EngineResumeCallback::new(node_execution_id, Arc::clone(&self.engine))),
                    callback_ids,
                )
                .await?;
        }
        Ok(true)
    }

    pub async fn handle_step_response(
        &self,
        node_execution_id: &str,
        response: StepResponse,
    ) -> ExecutionResult<()> {
        self.engine
            .handle_step_response(node_execution_id, response)
            .await?;
        Ok(())
    }

    pub async fn abort_task(
        &self,
        mode: TaskMode,
        ambiance: &Ambiance,
        task_id: &str,
    ) -> ExecutionResult<bool> {
        let aborted = self.executors.obtain(mode)?.abort_task(ambiance, task_id).await?;
        info!(task_id = %task_id, mode = %mode, aborted, "Task abort requested");
        Ok(aborted)
    }

    pub async fn expire_task(
        &self,
        mode: TaskMode,
        ambiance: &Ambiance,
        task_id: &str,
    ) -> ExecutionResult<bool> {
        let expired = self.executors.obtain(mode)?.expire_task(ambiance, task_id).await?;
        info!(task_id = %task_id, mode = %mode, expired, "Task expiry requested");
        Ok(expired)
    }
}
