// Two distinct fan-out paths for node changes:
// - EventEmitter: outbound pub/sub boundary for cross-process observers
// - ObserverSubject: synchronous in-process listeners

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tracing::warn;

use super::status::Status;
use super::types::{Ambiance, NodeExecution};

#[cfg(test)]
use mockall::automock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrchestrationEventType {
    NodeExecutionStart,
    NodeExecutionStatusUpdate,
    NodeExecutionUpdate,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrchestrationEvent {
    pub event_id: String,
    pub event_type: OrchestrationEventType,
    pub ambiance: Ambiance,
    pub node_execution: NodeExecution,
    pub emitted_at: DateTime<Utc>,
}

impl OrchestrationEvent {
    pub fn new(event_type: OrchestrationEventType, node_execution: &NodeExecution) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            ambiance: node_execution.ambiance.clone(),
            node_execution: node_execution.clone(),
            emitted_at: Utc::now(),
        }
    }
}

/// Outbound event channel to cross-process observers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, event: OrchestrationEvent) -> Result<()>;
}

/// Emitter backed by an unbounded tokio channel; the host drains the
/// receiver and forwards to its transport.
#[derive(Debug, Clone)]
pub struct ChannelEventEmitter {
    sender: mpsc::UnboundedSender<OrchestrationEvent>,
}

impl ChannelEventEmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OrchestrationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl EventEmitter for ChannelEventEmitter {
    async fn emit(&self, event: OrchestrationEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|e| anyhow::anyhow!("event channel closed: {}", e.0.event_id))
    }
}

/// Status change as seen by in-process listeners
#[derive(Debug, Clone, PartialEq)]
pub struct StepStatusUpdate {
    pub node_execution_id: String,
    pub plan_execution_id: String,
    pub status: Status,
    pub updated_at: DateTime<Utc>,
}

/// In-process listener; every method defaults to a no-op
pub trait NodeExecutionObserver: Send + Sync {
    fn on_node_start(&self, _node_execution: &NodeExecution) {}

    fn on_step_status_update(&self, _update: &StepStatusUpdate) {}

    fn on_node_update(&self, _node_execution: &NodeExecution) {}
}

#[derive(Default)]
pub struct ObserverSubject {
    observers: RwLock<Vec<Arc<dyn NodeExecutionObserver>>>,
}

impl ObserverSubject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn NodeExecutionObserver>) {
        match self.observers.write() {
            Ok(mut observers) => observers.push(observer),
            Err(_) => warn!("Observer registry poisoned, observer dropped"),
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot so no lock is held while observers run
    fn snapshot(&self) -> Vec<Arc<dyn NodeExecutionObserver>> {
        self.observers
            .read()
            .map(|o| o.clone())
            .unwrap_or_default()
    }

    pub fn fire_start(&self, node_execution: &NodeExecution) {
        for observer in self.snapshot() {
            observer.on_node_start(node_execution);
        }
    }

    pub fn fire_status_update(&self, update: &StepStatusUpdate) {
        for observer in self.snapshot() {
            observer.on_step_status_update(update);
        }
    }

    pub fn fire_update(&self, node_execution: &NodeExecution) {
        for observer in self.snapshot() {
            observer.on_node_update(node_execution);
        }
    }
}
