// Recording fakes for the execution layer - no side effects

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::events::{
    EventEmitter, NodeExecutionObserver, OrchestrationEvent, OrchestrationEventType,
    StepStatusUpdate,
};
use super::service::NodeExecutionService;
use super::status::Status;
use super::types::{Ambiance, NodeExecution, StepCategory, StepType};
use crate::store::InMemoryExecutionStore;

pub const PLAN: &str = "plan-1";

/// Emitter that keeps every event it is handed
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    pub events: Mutex<Vec<OrchestrationEvent>>,
    pub fail: AtomicBool,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<OrchestrationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event_type: OrchestrationEventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn status_events_for(&self, node_execution_id: &str) -> Vec<Status> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.event_type == OrchestrationEventType::NodeExecutionStatusUpdate
                    && e.node_execution.id == node_execution_id
            })
            .map(|e| e.node_execution.status)
            .collect()
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn emit(&self, event: OrchestrationEvent) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("emitter offline"));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Observer recording which callbacks fired
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub started: Mutex<Vec<String>>,
    pub status_updates: Mutex<Vec<StepStatusUpdate>>,
    pub updated: Mutex<Vec<String>>,
}

impl NodeExecutionObserver for RecordingObserver {
    fn on_node_start(&self, node_execution: &NodeExecution) {
        self.started.lock().unwrap().push(node_execution.id.clone());
    }

    fn on_step_status_update(&self, update: &StepStatusUpdate) {
        self.status_updates.lock().unwrap().push(update.clone());
    }

    fn on_node_update(&self, node_execution: &NodeExecution) {
        self.updated.lock().unwrap().push(node_execution.id.clone());
    }
}

pub fn node(id: &str, status: Status) -> NodeExecution {
    NodeExecution::new(
        Ambiance::new(PLAN),
        &format!("{id}-plan-node"),
        id,
        StepType::new("SHELL_SCRIPT", StepCategory::Step),
    )
    .with_id(id)
    .with_status(status)
}

pub fn child(id: &str, parent: &str, status: Status) -> NodeExecution {
    node(id, status).with_parent(parent)
}

pub struct Harness {
    pub store: Arc<InMemoryExecutionStore>,
    pub emitter: Arc<RecordingEmitter>,
    pub service: Arc<NodeExecutionService>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(InMemoryExecutionStore::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let service = Arc::new(NodeExecutionService::new(store.clone(), emitter.clone()));
        Self {
            store,
            emitter,
            service,
        }
    }

    /// Persist records and forget the start events they produced
    pub async fn seed(&self, records: Vec<NodeExecution>) -> Vec<NodeExecution> {
        let saved = self.service.save_all(records).await.unwrap();
        self.emitter.events.lock().unwrap().clear();
        saved
    }
}
