use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Engine-wide counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub status_updates: AtomicU64,
    pub guard_misses: AtomicU64,
    pub events_emitted: AtomicU64,
    pub emit_failures: AtomicU64,
    pub interrupts_raised: AtomicU64,
    pub tasks_queued: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_status_update(&self) {
        self.status_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_guard_miss(&self) {
        self.guard_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_event_emitted(&self) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_emit_failure(&self) {
        self.emit_failures.fetch_add(1, Ordering::Relaxed);
        warn!("Orchestration event could not be emitted");
    }

    pub fn record_interrupt_raised(&self) {
        self.interrupts_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_task_queued(&self) {
        self.tasks_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> EngineStats {
        EngineStats {
            status_updates: self.status_updates.load(Ordering::Relaxed),
            guard_misses: self.guard_misses.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            emit_failures: self.emit_failures.load(Ordering::Relaxed),
            interrupts_raised: self.interrupts_raised.load(Ordering::Relaxed),
            tasks_queued: self.tasks_queued.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Engine metrics: status_updates={}, guard_misses={}, events={}, emit_failures={}, interrupts={}, tasks={}",
            stats.status_updates,
            stats.guard_misses,
            stats.events_emitted,
            stats.emit_failures,
            stats.interrupts_raised,
            stats.tasks_queued
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub status_updates: u64,
    pub guard_misses: u64,
    pub events_emitted: u64,
    pub emit_failures: u64,
    pub interrupts_raised: u64,
    pub tasks_queued: u64,
}

/// Global metrics instance
static ENGINE_METRICS: std::sync::LazyLock<EngineMetrics> =
    std::sync::LazyLock::new(EngineMetrics::new);

pub fn engine_metrics() -> &'static EngineMetrics {
    &ENGINE_METRICS
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis(),
            "Operation completed"
        );
    }
}

#[macro_export]
macro_rules! time_operation {
    ($operation:expr) => {
        let _timer = $crate::observability::OperationTimer::new($operation);
    };
}
