// Node Execution - persisted run-time state of every step in a plan
//
// Status table and data model, the subtree walk, event fan-out, and the
// service that guards every status write.

pub mod events;
pub mod service;
pub mod status;
pub mod tree;
pub mod types;

#[cfg(test)]
pub mod mocks;


pub use events::{
    ChannelEventEmitter, EventEmitter, NodeExecutionObserver, OrchestrationEvent,
    OrchestrationEventType, StepStatusUpdate,
};
pub use service::NodeExecutionService;
pub use status::Status;
pub use types::{
    Ambiance, ExecutableResponse, FailureInfo, InterruptEffect, InterruptKind, Level,
    NodeExecution, StepCategory, StepType, TimeoutDetails,
};
