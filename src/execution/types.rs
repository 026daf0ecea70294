// Core types for persisted node execution state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::status::Status;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepCategory {
    Pipeline,
    Stage,
    Step,
    Strategy,
    Fork,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepType {
    pub step_type: String,
    pub category: StepCategory,
}

impl StepType {
    pub fn new(step_type: &str, category: StepCategory) -> Self {
        Self {
            step_type: step_type.to_string(),
            category,
        }
    }
}

/// One hop of the execution-context path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub runtime_id: String,
    pub setup_id: String,
    pub identifier: String,
    pub step_type: Option<StepType>,
}

/// Execution-context path identifying a node's position in the plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub plan_execution_id: String,
    pub levels: Vec<Level>,
    #[serde(default)]
    pub setup_abstractions: HashMap<String, String>,
}

impl Ambiance {
    pub fn new(plan_execution_id: &str) -> Self {
        Self {
            plan_execution_id: plan_execution_id.to_string(),
            ..Default::default()
        }
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn current_runtime_id(&self) -> Option<&str> {
        self.current_level().map(|level| level.runtime_id.as_str())
    }

    pub fn parent_runtime_id(&self) -> Option<&str> {
        let len = self.levels.len();
        if len < 2 {
            return None;
        }
        Some(self.levels[len - 2].runtime_id.as_str())
    }

    /// New ambiance one level deeper; the receiver is left untouched
    pub fn clone_for_child(&self, level: Level) -> Self {
        let mut child = self.clone();
        child.levels.push(level);
        child
    }
}

/// How a node is currently suspended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Task {
        task_id: String,
        task_name: String,
    },
    Async {
        callback_ids: Vec<String>,
    },
    Children {
        child_ids: Vec<String>,
    },
    Child {
        child_id: String,
    },
    Sync {
        detail: Value,
    },
}

/// Stamped on a node when its deadline fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutDetails {
    pub timeout_instance_id: String,
    pub expired_at: DateTime<Utc>,
    /// Set once the MARK_EXPIRED interrupt for this deadline is registered
    #[serde(default)]
    pub interrupt_id: Option<String>,
}

impl TimeoutDetails {
    pub fn new(timeout_instance_id: &str, expired_at: DateTime<Utc>) -> Self {
        Self {
            timeout_instance_id: timeout_instance_id.to_string(),
            expired_at,
            interrupt_id: None,
        }
    }

    pub fn with_interrupt(mut self, interrupt_id: &str) -> Self {
        self.interrupt_id = Some(interrupt_id.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterruptKind {
    Abort,
    AbortAll,
    Retry,
    MarkExpired,
    MarkSuccess,
    MarkFailed,
    Pause,
    Resume,
}

/// Audit record of an interrupt that took effect on a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptEffect {
    pub interrupt_id: String,
    pub interrupt_kind: InterruptKind,
    pub took_effect_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,
    #[serde(default)]
    pub failure_types: Vec<String>,
}

/// Persisted run-time record of one step inside a plan execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub plan_execution_id: String,
    pub plan_node_id: String,
    pub identifier: String,
    pub name: String,
    pub step_type: StepType,
    pub parent_id: Option<String>,
    pub previous_id: Option<String>,
    pub notify_id: Option<String>,
    pub status: Status,
    #[serde(default)]
    pub old_retry: bool,
    pub ambiance: Ambiance,
    #[serde(default)]
    pub executable_responses: Vec<ExecutableResponse>,
    pub resolved_step_parameters: Option<String>,
    pub timeout_details: Option<TimeoutDetails>,
    #[serde(default)]
    pub timeout_instance_ids: Vec<String>,
    #[serde(default)]
    pub retry_ids: Vec<String>,
    #[serde(default)]
    pub interrupt_histories: Vec<InterruptEffect>,
    pub failure_info: Option<FailureInfo>,
    pub progress_data: Option<Value>,
    /// None until the record has been persisted once
    pub version: Option<u64>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl NodeExecution {
    /// Fresh, never-persisted record in `Queued`
    pub fn new(ambiance: Ambiance, plan_node_id: &str, identifier: &str, step_type: StepType) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            plan_execution_id: ambiance.plan_execution_id.clone(),
            plan_node_id: plan_node_id.to_string(),
            identifier: identifier.to_string(),
            name: identifier.to_string(),
            step_type,
            parent_id: None,
            previous_id: None,
            notify_id: None,
            status: Status::Queued,
            old_retry: false,
            ambiance,
            executable_responses: Vec::new(),
            resolved_step_parameters: None,
            timeout_details: None,
            timeout_instance_ids: Vec::new(),
            retry_ids: Vec::new(),
            interrupt_histories: Vec::new(),
            failure_info: None,
            progress_data: None,
            version: None,
            start_ts: None,
            end_ts: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_previous(mut self, previous_id: &str) -> Self {
        self.previous_id = Some(previous_id.to_string());
        self
    }

    pub fn with_notify_id(mut self, notify_id: &str) -> Self {
        self.notify_id = Some(notify_id.to_string());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn is_persisted(&self) -> bool {
        self.version.is_some()
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}
