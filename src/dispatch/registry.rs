use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::collaborators::TaskExecutor;
use crate::errors::{ExecutionError, ExecutionResult};

/// Execution strategy for remote work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    /// Caller-visible request/response over a worker
    Sync,
    /// Fire and forget; completion arrives through wait/notify
    Async,
}

impl fmt::Display for TaskMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskMode::Sync => write!(f, "sync"),
            TaskMode::Async => write!(f, "async"),
        }
    }
}

#[derive(Default, Clone)]
pub struct TaskExecutorRegistry {
    executors: HashMap<TaskMode, Arc<dyn TaskExecutor>>,
}

impl TaskExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_executor(mut self, mode: TaskMode, executor: Arc<dyn TaskExecutor>) -> Self {
        self.register(mode, executor);
        self
    }

    /// Replaces any executor already bound to `mode`
    pub fn register(&mut self, mode: TaskMode, executor: Arc<dyn TaskExecutor>) {
        self.executors.insert(mode, executor);
    }

    pub fn obtain(&self, mode: TaskMode) -> ExecutionResult<Arc<dyn TaskExecutor>> {
        self.executors
            .get(&mode)
            .cloned()
            .ok_or(ExecutionError::ExecutorNotRegistered { mode })
    }

    pub fn modes(&self) -> Vec<TaskMode> {
        self.executors.keys().copied().collect()
    }
}
