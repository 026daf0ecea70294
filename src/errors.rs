use thiserror::Error;

use crate::dispatch::TaskMode;
use crate::store::StoreError;

/// Failures surfaced by the node execution engine.
///
/// Contention is not an error here: a status guard that no longer holds
/// comes back as `Ok(None)` from `update_status_with_ops`.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Node execution not found: {0}")]
    NotFound(String),

    /// An unconditional write matched nothing, so the record vanished
    #[error("Node execution {id} could not be updated: record no longer exists")]
    UpdateFailed { id: String },

    #[error("Node execution {id} was modified concurrently (expected version {expected_version:?})")]
    StaleRecord {
        id: String,
        expected_version: Option<u64>,
    },

    /// Old-retry records only take retry-chain rewrites
    #[error("Node execution {id} was superseded by a retry")]
    Superseded { id: String },

    #[error("Internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No task executor registered for mode {mode:?}")]
    ExecutorNotRegistered { mode: TaskMode },

    #[error("Task executor for mode {mode:?} returned no task id for node {node_execution_id}")]
    TaskIdMissing {
        mode: TaskMode,
        node_execution_id: String,
    },

    /// The task was submitted but could not be subscribed to; an abort
    /// was attempted for it
    #[error("Task {task_id} for node {node_execution_id} was queued but not subscribed: {source}")]
    TaskSubscriptionFailed {
        task_id: String,
        node_execution_id: String,
        aborted: bool,
        #[source]
        source: anyhow::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

impl ExecutionError {
    /// Structural failures that indicate corruption rather than a bad request
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ExecutionError::UpdateFailed { .. }
                | ExecutionError::InternalInvariantViolation(_)
                | ExecutionError::TaskIdMissing { .. }
        )
    }
}
