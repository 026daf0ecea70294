// Narrow contracts for everything the engine consumes but does not own.
// Hosts supply implementations; their error types stay opaque (anyhow).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::execution::status::Status;
use crate::execution::types::{Ambiance, FailureInfo, InterruptKind, StepType};

#[cfg(test)]
use mockall::automock;

/// Who asked for an interrupt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "issuer", rename_all = "snake_case")]
pub enum IssuedBy {
    Timeout {
        timeout_instance_id: String,
        issued_at: DateTime<Utc>,
    },
    Engine {
        issued_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub kind: InterruptKind,
    pub plan_execution_id: String,
    pub node_execution_id: Option<String>,
    pub issued_by: IssuedBy,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait InterruptManager: Send + Sync {
    /// Queue an interrupt; returns its id
    async fn register(&self, interrupt: Interrupt) -> Result<String>;
}

/// Resumed once every correlation id of a wait has completed
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NotifyCallback: Send + Sync {
    async fn notify(&self, responses: HashMap<String, Value>) -> Result<()>;

    async fn notify_error(&self, responses: HashMap<String, Value>) -> Result<()>;
}

/// Intermediate progress for a correlation id; never resumes anything
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProgressCallback: Send + Sync {
    async fn notify(&self, correlation_id: &str, progress: Value) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait WaitNotifyEngine: Send + Sync {
    /// Fan-in wait: `callback` fires once all `correlation_ids` are done.
    /// Returns the wait id.
    async fn wait_for_all_on(
        &self,
        callback: Arc<dyn NotifyCallback>,
        correlation_ids: Vec<String>,
    ) -> Result<String>;

    async fn subscribe_progress(
        &self,
        callback: Arc<dyn ProgressCallback>,
        correlation_id: String,
    ) -> Result<()>;
}

/// Outcome reported by a step once its work is over
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub status: Status,
    pub failure_info: Option<FailureInfo>,
    #[serde(default)]
    pub outcome: Option<Value>,
}

impl StepResponse {
    pub fn success(outcome: Option<Value>) -> Self {
        Self {
            status: Status::Success,
            failure_info: None,
            outcome,
        }
    }

    pub fn failed(failure_info: FailureInfo) -> Self {
        Self {
            status: Status::Failed,
            failure_info: Some(failure_info),
            outcome: None,
        }
    }
}

/// The driving engine that decides what runs next
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OrchestrationEngine: Send + Sync {
    async fn start_node_execution(&self, node_execution_id: &str, ambiance: &Ambiance) -> Result<()>;

    async fn resume_node_execution(
        &self,
        node_execution_id: &str,
        responses: HashMap<String, Value>,
        as_error: bool,
    ) -> Result<()>;

    async fn handle_step_response(&self, node_execution_id: &str, response: StepResponse) -> Result<()>;

    async fn handle_progress(&self, node_execution_id: &str, progress: Value) -> Result<()>;
}

/// Per step type capability to interpret resolved parameters
#[cfg_attr(test, automock)]
pub trait Step: Send + Sync {
    fn deserialize_parameters(&self, raw: &str) -> Result<Value>;
}

#[cfg_attr(test, automock)]
pub trait StepRegistry: Send + Sync {
    fn obtain(&self, step_type: &StepType) -> Result<Arc<dyn Step>>;
}

/// Opaque unit of remote work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_name: String,
    pub payload: Value,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Submit a task; `None` means the executor could not assign an id
    async fn queue_task(
        &self,
        context: &HashMap<String, String>,
        task: &TaskRequest,
    ) -> Result<Option<String>>;

    async fn abort_task(&self, ambiance: &Ambiance, task_id: &str) -> Result<bool>;

    async fn expire_task(&self, ambiance: &Ambiance, task_id: &str) -> Result<bool>;
}
