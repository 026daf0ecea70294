// Node Execution Engine
// Tracks and mutates the run-time state of every node of an executing plan:
// guarded status transitions, subtree operations, task dispatch, timeouts.

pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod execution;
pub mod observability;
pub mod store;
pub mod telemetry;
pub mod timeout;
pub mod wait_notify;

// Re-export key types for easy access
pub use collaborators::{
    Interrupt, InterruptManager, IssuedBy, NotifyCallback, OrchestrationEngine, ProgressCallback,
    Step, StepRegistry, StepResponse, TaskExecutor, TaskRequest, WaitNotifyEngine,
};
pub use config::{config, init_config, DispatchConfig, EngineConfig, StoreBackend, TimeoutConfig};
pub use dispatch::{TaskDispatchService, TaskExecutorRegistry, TaskMode};
pub use errors::{ExecutionError, ExecutionResult};
pub use execution::{
    Ambiance, ChannelEventEmitter, EventEmitter, ExecutableResponse, NodeExecution,
    NodeExecutionObserver, NodeExecutionService, OrchestrationEvent, OrchestrationEventType,
    Status, StepStatusUpdate,
};
pub use observability::{engine_metrics, EngineMetrics, OperationTimer};
pub use store::{open_store, ExecutionStore, InMemoryExecutionStore, NodeQuery, NodeUpdate, StoreError};
#[cfg(feature = "database")]
pub use store::SqliteExecutionStore;
pub use telemetry::{create_node_span, generate_correlation_id, init_telemetry};
pub use timeout::{
    arm_default_node_timeout, arm_node_timeout, DeadlineScheduler, TimeoutCallback, TimeoutInstance, TimeoutOutcome};
pub use wait_notify::InMemoryWaitNotifyEngine;
