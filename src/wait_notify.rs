// In-process Wait/Notify engine
//
// Correlation ids complete independently; a wait fires its callback once,
// when the last of its ids completes. A completion nobody waits on yet is
// held until a wait consumes it, up to a bounded number of ids; past the
// bound the oldest unclaimed completions are dropped.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::collaborators::{NotifyCallback, ProgressCallback, WaitNotifyEngine};

struct PendingWait {
    callback: Arc<dyn NotifyCallback>,
    pending: HashSet<String>,
    responses: HashMap<String, Value>,
    errored: bool,
}

const DEFAULT_EARLY_COMPLETION_LIMIT: usize = 10_000;

struct Completed {
    data: Value,
    is_error: bool,
    seq: u64,
}

#[derive(Default)]
struct Registry {
    waits: HashMap<String, PendingWait>,
    waits_by_correlation: HashMap<String, Vec<String>>,
    early: HashMap<String, Completed>,
    early_order: VecDeque<(String, u64)>,
    next_seq: u64,
    progress: HashMap<String, Vec<Arc<dyn ProgressCallback>>>,
}

impl Registry {
    fn hold_early(&mut self, correlation_id: &str, data: Value, is_error: bool, limit: usize) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.early.insert(
            correlation_id.to_string(),
            Completed {
                data,
                is_error,
                seq,
            },
        );
        self.early_order.push_back((correlation_id.to_string(), seq));
        while self.early_order.len() > limit {
            let Some((evicted, evicted_seq)) = self.early_order.pop_front() else {
                break;
            };
            if self.early.get(&evicted).is_some_and(|c| c.seq == evicted_seq) {
                self.early.remove(&evicted);
                warn!(correlation_id = %evicted, "Dropping unclaimed completion");
            }
        }
    }
}

/// Callback ready to run, collected under the lock and invoked after it
struct Ready {
    wait_id: String,
    callback: Arc<dyn NotifyCallback>,
    responses: HashMap<String, Value>,
    errored: bool,
}

pub struct InMemoryWaitNotifyEngine {
    registry: Mutex<Registry>,
    early_completion_limit: usize,
}

impl Default for InMemoryWaitNotifyEngine {
    fn default() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            early_completion_limit: DEFAULT_EARLY_COMPLETION_LIMIT,
        }
    }
}

impl InMemoryWaitNotifyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of completions held for waits not registered yet
    pub fn with_early_completion_limit(mut self, limit: usize) -> Self {
        self.early_completion_limit = limit.max(1);
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|_| anyhow!("wait/notify registry lock poisoned"))
    }

    /// Mark a correlation id done and run every wait it completes.
    /// Returns how many waits fired.
    pub async fn done_with(&self, correlation_id: &str, data: Value, is_error: bool) -> Result<usize> {
        let ready = {
            let mut registry = self.lock()?;
            registry.progress.remove(correlation_id);

            let wait_ids = registry
                .waits_by_correlation
                .remove(correlation_id)
                .unwrap_or_default();
            if wait_ids.is_empty() {
                registry.hold_early(correlation_id, data.clone(), is_error, self.early_completion_limit);
            }
            let mut ready = Vec::new();
            for wait_id in wait_ids {
                let Some(wait) = registry.waits.get_mut(&wait_id) else {
                    continue;
                };
                wait.pending.remove(correlation_id);
                wait.responses.insert(correlation_id.to_string(), data.clone());
                wait.errored |= is_error;
                if wait.pending.is_empty() {
                    if let Some(wait) = registry.waits.remove(&wait_id) {
                        ready.push(Ready {
                            wait_id,
                            callback: wait.callback,
                            responses: wait.responses,
                            errored: wait.errored,
                        });
                    }
                }
            }
            ready
        };

        let fired = ready.len();
        for wait in ready {
            fire(wait).await;
        }
        debug!(correlation_id = %correlation_id, fired, "Correlation id completed");
        Ok(fired)
    }

    /// Forward progress to subscribers of a correlation id
    pub async fn send_progress(&self, correlation_id: &str, progress: Value) -> Result<usize> {
        let subscribers = {
            let registry = self.lock()?;
            registry
                .progress
                .get(correlation_id)
                .cloned()
                .unwrap_or_default()
        };
        for subscriber in &subscribers {
            if let Err(e) = subscriber.notify(correlation_id, progress.clone()).await {
                warn!(correlation_id = %correlation_id, error = %e, "Progress callback failed");
            }
        }
        Ok(subscribers.len())
    }

    pub fn pending_waits(&self) -> usize {
        self.registry.lock().map(|r| r.waits.len()).unwrap_or(0)
    }

    /// Completions held for waits that have not been registered yet
    pub fn unclaimed_completions(&self) -> usize {
        self.registry.lock().map(|r| r.early.len()).unwrap_or(0)
    }
}

async fn fire(wait: Ready) {
    let result = if wait.errored {
        wait.callback.notify_error(wait.responses).await
    } else {
        wait.callback.notify(wait.responses).await
    };
    match result {
        Ok(()) => info!(wait_id = %wait.wait_id, "Wait resolved"),
        Err(e) => warn!(wait_id = %wait.wait_id, error = %e, "Notify callback failed"),
    }
}

#[async_trait]
impl WaitNotifyEngine for InMemoryWaitNotifyEngine {
    async fn wait_for_all_on(
        &self,
        callback: Arc<dyn NotifyCallback>,
        correlation_ids: Vec<String>,
    ) -> Result<String> {
        let wait_id = uuid::Uuid::new_v4().to_string();
        let ready = {
            let mut registry = self.lock()?;
            let mut wait = PendingWait {
                callback,
                pending: HashSet::new(),
                responses: HashMap::new(),
                errored: false,
            };
            for correlation_id in correlation_ids {
                match registry.early.remove(&correlation_id) {
                    Some(done) => {
                        wait.responses.insert(correlation_id, done.data);
                        wait.errored |= done.is_error;
                    }
                    None => {
                        registry
                            .waits_by_correlation
                            .entry(correlation_id.clone())
                            .or_default()
                            .push(wait_id.clone());
                        wait.pending.insert(correlation_id);
                    }
                }
            }
            if wait.pending.is_empty() {
                Some(Ready {
                    wait_id: wait_id.clone(),
                    callback: wait.callback,
                    responses: wait.responses,
                    errored: wait.errored,
                })
            } else {
                registry.waits.insert(wait_id.clone(), wait);
                None
            }
        };

        if let Some(ready) = ready {
            fire(ready).await;
        }
        Ok(wait_id)
    }

    async fn subscribe_progress(
        &self,
        callback: Arc<dyn ProgressCallback>,
        correlation_id: String,
    ) -> Result<()> {
        let mut registry = self.lock()?;
        registry.progress.entry(correlation_id).or_default().push(callback);
        Ok(())
    }
}
