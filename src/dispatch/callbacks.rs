use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::collaborators::{NotifyCallback, OrchestrationEngine, ProgressCallback};
use crate::execution::NodeExecutionService;
use crate::store::NodeUpdate;

/// Resumes the owning node once its wait completes
pub struct EngineResumeCallback {
    node_execution_id: String,
    engine: Arc<dyn OrchestrationEngine>,
}

impl EngineResumeCallback {
    pub fn new(node_execution_id: &str, engine: Arc<dyn OrchestrationEngine>) -> Self {
        Self {
            node_execution_id: node_execution_id.to_string(),
            engine,
        }
    }
}

#[async_trait]
impl NotifyCallback for EngineResumeCallback {
    async fn notify(&self, responses: HashMap<String, Value>) -> Result<()> {
        info!(node_execution_id = %self.node_execution_id, "Resuming node execution");
        self.engine
            .resume_node_execution(&self.node_execution_id, responses, false)
            .await
    }

    async fn notify_error(&self, responses: HashMap<String, Value>) -> Result<()> {
        info!(node_execution_id = %self.node_execution_id, "Resuming node execution with error");
        self.engine
            .resume_node_execution(&self.node_execution_id, responses, true)
            .await
    }
}

/// Records progress on the node and hands it to the engine without resuming
pub struct EngineProgressCallback {
    node_execution_id: String,
    node_service: Arc<NodeExecutionService>,
    engine: Arc<dyn OrchestrationEngine>,
}

impl EngineProgressCallback {
    pub fn new(
        node_execution_id: &str,
        node_service: Arc<NodeExecutionService>,
        engine: Arc<dyn OrchestrationEngine>,
    ) -> Self {
        Self {
            node_execution_id: node_execution_id.to_string(),
            node_service,
            engine,
        }
    }
}

#[async_trait]
impl ProgressCallback for EngineProgressCallback {
    async fn notify(&self, correlation_id: &str, progress: Value) -> Result<()> {
        debug!(
            node_execution_id = %self.node_execution_id,
            correlation_id = %correlation_id,
            "Progress received"
        );
        self.node_service
            .update(
                &self.node_execution_id,
                NodeUpdate::new().set_progress_data(progress.clone()),
            )
            .await?;
        self.engine
            .handle_progress(&self.node_execution_id, progress)
            .await
    }
}
