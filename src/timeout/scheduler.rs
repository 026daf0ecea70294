use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A registered deadline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutInstance {
    pub id: String,
    pub deadline: DateTime<Utc>,
}

impl TimeoutInstance {
    pub fn new(id: &str, deadline: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            deadline,
        }
    }

    /// Fresh id, expiring `after` from now
    pub fn expiring_in(after: chrono::Duration) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deadline: Utc::now() + after,
        }
    }
}

#[async_trait]
pub trait DeadlineHandler: Send + Sync {
    async fn on_deadline(&self, instance: TimeoutInstance);
}

/// Sleeps on the tokio runtime until each deadline, then hands it to its
/// handler. Pending deadlines can be cancelled by id.
#[derive(Default, Clone)]
pub struct DeadlineScheduler {
    pending: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl DeadlineScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `instance`; an earlier registration with the same id is replaced
    pub fn register(&self, instance: TimeoutInstance, handler: Arc<dyn DeadlineHandler>) {
        let wait = (instance.deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let id = instance.id.clone();
        let pending = Arc::clone(&self.pending);

        let task_id = id.clone();
        let fire = async move {
            tokio::time::sleep(wait).await;
            if let Ok(mut pending) = pending.lock() {
                pending.remove(&task_id);
            }
            debug!(timeout_instance_id = %task_id, "Deadline reached");
            handler.on_deadline(instance).await;
        };

        // spawn under the lock so the task cannot untrack itself first
        match self.pending.lock() {
            Ok(mut pending) => {
                let handle = tokio::spawn(fire);
                if let Some(previous) = pending.insert(id.clone(), handle) {
                    previous.abort();
                }
                info!(timeout_instance_id = %id, wait_ms = wait.as_millis() as u64, "Deadline registered");
            }
            Err(_) => {
                warn!(timeout_instance_id = %id, "Deadline registry poisoned, deadline not cancellable");
                tokio::spawn(fire);
            }
        }
    }

    /// Returns false when the deadline already fired or was never registered
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.pending.lock().ok().and_then(|mut p| p.remove(id));
        match removed {
            Some(handle) => {
                handle.abort();
                debug!(timeout_instance_id = %id, "Deadline cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self, ids: &[String]) -> usize {
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DeadlineHandler for Recorder {
        async fn on_deadline(&self, instance: TimeoutInstance) {
            self.fired.lock().unwrap().push(instance.id);
        }
    }

    #[tokio::test]
    async fn test_past_deadline_fires_immediately() {
        let scheduler = DeadlineScheduler::new();
        let recorder = Arc::new(Recorder::default());
        scheduler.register(
            TimeoutInstance::new("late", Utc::now() - chrono::Duration::seconds(1)),
            recorder.clone(),
        );

        for _ in 0..50 {
            if !recorder.fired.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(*recorder.fired.lock().unwrap(), vec!["late".to_string()]);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_deadline_never_fires() {
        let scheduler = DeadlineScheduler::new();
        let recorder = Arc::new(Recorder::default());
        scheduler.register(
            TimeoutInstance::new("far", Utc::now() + chrono::Duration::hours(1)),
            recorder.clone(),
        );
        scheduler.register(
            TimeoutInstance::new("farther", Utc::now() + chrono::Duration::hours(2)),
            recorder.clone(),
        );
        assert_eq!(scheduler.pending(), 2);

        let cancelled = scheduler.cancel_all(&["far".to_string(), "unknown".to_string()]);
        assert_eq!(cancelled, 1);
        assert!(scheduler.cancel("farther"));
        assert!(!scheduler.cancel("farther"));
        assert_eq!(scheduler.pending(), 0);
        assert!(recorder.fired.lock().unwrap().is_empty());
    }
}
