// Task Dispatch - hands remote work to pluggable executors and resumes the
// driving engine when that work completes

pub mod callbacks;
pub mod registry;
pub mod service;

pub use callbacks::{EngineProgressCallback, EngineResumeCallback};
pub use registry::{TaskExecutorRegistry, TaskMode};
pub use service::TaskDispatchService;
