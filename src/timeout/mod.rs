// Timeouts - deadline scheduling and expiry handling for node executions

pub mod callback;
pub mod scheduler;

pub use callback::{TimeoutCallback, TimeoutEvent, TimeoutOutcome, TimeoutTracker};
pub use scheduler::{DeadlineHandler, DeadlineScheduler, TimeoutInstance};

use std::sync::Arc;
use tracing::info;

use crate::collaborators::InterruptManager;
use crate::config::TimeoutConfig;
use crate::errors::ExecutionResult;
use crate::execution::{NodeExecution, NodeExecutionService};
use crate::store::NodeUpdate;

/// Arm a deadline for a node at start time.
///
/// The deadline id is recorded on the node so it can be cancelled once the
/// node finishes (see `NodeExecutionService::timeout_instance_ids`).
pub async fn arm_node_timeout(
    scheduler: &DeadlineScheduler,
    node_service: Arc<NodeExecutionService>,
    interrupts: Arc<dyn InterruptManager>,
    node: &NodeExecution,
    after: chrono::Duration,
) -> ExecutionResult<TimeoutInstance> {
    let instance = TimeoutInstance::expiring_in(after);
    node_service
        .update(
            &node.id,
            NodeUpdate::new().push_timeout_instance_id(&instance.id),
        )
        .await?;

    let callback = TimeoutCallback::new(
        &node.plan_execution_id,
        &node.id,
        node_service,
        interrupts,
    );
    scheduler.register(instance.clone(), Arc::new(callback));
    info!(
        node_execution_id = %node.id,
        timeout_instance_id = %instance.id,
        deadline = %instance.deadline,
        "Node timeout armed"
    );
    Ok(instance)
}

/// Arm the configured default deadline for a node
pub async fn arm_default_node_timeout(
    scheduler: &DeadlineScheduler,
    node_service: Arc<NodeExecutionService>,
    interrupts: Arc<dyn InterruptManager>,
    node: &NodeExecution,
    config: &TimeoutConfig,
) -> ExecutionResult<TimeoutInstance> {
    arm_node_timeout(scheduler, node_service, interrupts, node, config.default_timeout()).await
}
