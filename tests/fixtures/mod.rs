//! Shared fakes for integration tests: recording collaborators wired to the
//! in-memory store.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use node_execution_engine::{
    Ambiance, EventEmitter, Interrupt, InterruptManager, NodeExecution, NodeExecutionService,
    OrchestrationEngine, OrchestrationEvent, OrchestrationEventType, Status, StepResponse,
    TaskExecutor, TaskRequest, InMemoryExecutionStore,
};
use node_execution_engine::execution::{StepCategory, StepType};

pub const PLAN: &str = "plan-integration";

#[derive(Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<OrchestrationEvent>>,
}

impl RecordingEmitter {
    pub fn status_events_for(&self, id: &str) -> Vec<Status> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| {
                e.event_type == OrchestrationEventType::NodeExecutionStatusUpdate
                    && e.node_execution.id == id
            })
            .map(|e| e.node_execution.status)
            .collect()
    }

    pub fn count(&self, event_type: OrchestrationEventType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventEmitter for RecordingEmitter {
    async fn emit(&self, event: OrchestrationEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineCall {
    Start(String),
    Resume {
        id: String,
        responses: HashMap<String, Value>,
        as_error: bool,
    },
    StepResponse(String, Status),
    Progress(String, Value),
}

/// Orchestration engine that only records what it was asked to do
#[derive(Default)]
pub struct RecordingEngine {
    pub calls: Mutex<Vec<EngineCall>>,
}

impl RecordingEngine {
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl OrchestrationEngine for RecordingEngine {
    async fn start_node_execution(&self, node_execution_id: &str, _ambiance: &Ambiance) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::Start(node_execution_id.to_string()));
        Ok(())
    }

    async fn resume_node_execution(
        &self,
        node_execution_id: &str,
        responses: HashMap<String, Value>,
        as_error: bool,
    ) -> Result<()> {
        self.calls.lock().unwrap().push(EngineCall::Resume {
            id: node_execution_id.to_string(),
            responses,
            as_error,
        });
        Ok(())
    }

    async fn handle_step_response(&self, node_execution_id: &str, response: StepResponse) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::StepResponse(node_execution_id.to_string(), response.status));
        Ok(())
    }

    async fn handle_progress(&self, node_execution_id: &str, progress: Value) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(EngineCall::Progress(node_execution_id.to_string(), progress));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingInterrupts {
    pub registered: Mutex<Vec<Interrupt>>,
    pub failures_left: AtomicU32,
}

impl RecordingInterrupts {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            registered: Mutex::new(Vec::new()),
            failures_left: AtomicU32::new(failures),
        }
    }

    pub fn registered(&self) -> Vec<Interrupt> {
        self.registered.lock().unwrap().clone()
    }
}

#[async_trait]
impl InterruptManager for RecordingInterrupts {
    async fn register(&self, interrupt: Interrupt) -> Result<String> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(anyhow!("interrupt queue unavailable"));
        }
        let mut registered = self.registered.lock().unwrap();
        registered.push(interrupt);
        Ok(format!("interrupt-{}", registered.len()))
    }
}

/// Executor handing out sequential task ids
#[derive(Default)]
pub struct SequentialExecutor {
    next: AtomicU32,
    pub submitted: Mutex<Vec<TaskRequest>>,
    pub aborted: Mutex<Vec<String>>,
}

#[async_trait]
impl TaskExecutor for SequentialExecutor {
    async fn queue_task(
        &self,
        _context: &HashMap<String, String>,
        task: &TaskRequest,
    ) -> Result<Option<String>> {
        self.submitted.lock().unwrap().push(task.clone());
        let id = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Some(format!("task-{id}")))
    }

    async fn abort_task(&self, _ambiance: &Ambiance, task_id: &str) -> Result<bool> {
        self.aborted.lock().unwrap().push(task_id.to_string());
        Ok(true)
    }

    async fn expire_task(&self, _ambiance: &Ambiance, _task_id: &str) -> Result<bool> {
        Ok(true)
    }
}

pub struct Engine {
    pub store: Arc<InMemoryExecutionStore>,
    pub emitter: Arc<RecordingEmitter>,
    pub service: Arc<NodeExecutionService>,
}

pub fn engine() -> Engine {
    let store = Arc::new(InMemoryExecutionStore::new());
    let emitter = Arc::new(RecordingEmitter::default());
    let service = Arc::new(NodeExecutionService::new(store.clone(), emitter.clone()));
    Engine {
        store,
        emitter,
        service,
    }
}

pub fn node(id: &str) -> NodeExecution {
    NodeExecution::new(
        Ambiance::new(PLAN),
        &format!("{id}-plan-node"),
        id,
        StepType::new("HTTP", StepCategory::Step),
    )
    .with_id(id)
}

pub fn child(id: &str, parent: &str) -> NodeExecution {
    node(id).with_parent(parent)
}
