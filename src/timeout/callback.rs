// Reacts to a fired deadline for one node execution.
//
// Armed -> Fired -> {Ignored | Dispatched}; a failure while Fired re-arms so
// the scheduler may deliver the deadline again.

use async_trait::async_trait;
use chrono::Utc;
use statig::prelude::*;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use super::scheduler::{DeadlineHandler, TimeoutInstance};
use crate::collaborators::{Interrupt, InterruptManager, IssuedBy};
use crate::errors::{ExecutionError, ExecutionResult};
use crate::execution::{InterruptKind, NodeExecutionService, TimeoutDetails};
use crate::observability::{engine_metrics, EngineMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutEvent {
    Fire,
    Ignore,
    Dispatch,
    Fail,
}

/// What a delivery of the deadline amounted to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// The node was no longer running, or another deadline already expired it
    Ignored,
    /// The node was stamped and a MarkExpired interrupt raised
    Dispatched,
    /// This deadline was already handled, by this callback or by an
    /// earlier one whose interrupt is recorded on the node
    Duplicate,
}

#[derive(Debug, Default)]
pub struct TimeoutTracker {
    pub deliveries: u32,
    pub failures: u32,
}

#[state_machine(initial = "State::armed()", state(derive(Debug, PartialEq, Eq)))]
impl TimeoutTracker {
    #[state]
    fn armed(&mut self, event: &TimeoutEvent) -> Outcome<State> {
        match event {
            TimeoutEvent::Fire => {
                self.deliveries += 1;
                Transition(State::fired())
            }
            _ => Handled,
        }
    }

    #[state]
    fn fired(&mut self, event: &TimeoutEvent) -> Outcome<State> {
        match event {
            TimeoutEvent::Ignore => Transition(State::ignored()),
            TimeoutEvent::Dispatch => Transition(State::dispatched()),
            TimeoutEvent::Fail => {
                self.failures += 1;
                Transition(State::armed())
            }
            TimeoutEvent::Fire => Handled,
        }
    }

    #[state]
    fn ignored(event: &TimeoutEvent) -> Outcome<State> {
        debug!(event = ?event, "Timeout already ignored");
        Handled
    }

    #[state]
    fn dispatched(event: &TimeoutEvent) -> Outcome<State> {
        debug!(event = ?event, "Timeout already dispatched");
        Handled
    }
}

pub struct TimeoutCallback {
    plan_execution_id: String,
    node_execution_id: String,
    node_service: Arc<NodeExecutionService>,
    interrupts: Arc<dyn InterruptManager>,
    tracker: Mutex<StateMachine<TimeoutTracker>>,
    metrics: &'static EngineMetrics,
}

impl TimeoutCallback {
    pub fn new(
        plan_execution_id: &str,
        node_execution_id: &str,
        node_service: Arc<NodeExecutionService>,
        interrupts: Arc<dyn InterruptManager>,
    ) -> Self {
        Self {
            plan_execution_id: plan_execution_id.to_string(),
            node_execution_id: node_execution_id.to_string(),
            node_service,
            interrupts,
            tracker: Mutex::new(TimeoutTracker::default().state_machine()),
            metrics: engine_metrics(),
        }
    }

    pub fn node_execution_id(&self) -> &str {
        &self.node_execution_id
    }

    pub fn is_armed(&self) -> bool {
        self.with_tracker(|sm| matches!(sm.state(), State::Armed { .. }))
            .unwrap_or(false)
    }

    pub fn is_dispatched(&self) -> bool {
        self.with_tracker(|sm| matches!(sm.state(), State::Dispatched { .. }))
            .unwrap_or(false)
    }

    fn with_tracker<T>(&self, f: impl FnOnce(&mut StateMachine<TimeoutTracker>) -> T) -> ExecutionResult<T> {
        let mut tracker = self.tracker.lock().map_err(|_| {
            ExecutionError::InternalInvariantViolation("timeout tracker lock poisoned".to_string())
        })?;
        Ok(f(&mut tracker))
    }

    fn settle(&self, event: TimeoutEvent) -> ExecutionResult<()> {
        self.with_tracker(|sm| sm.handle(&event))
    }

    /// Handle one delivery of `instance`. Safe to call any number of times.
    pub async fn on_timeout(&self, instance: &TimeoutInstance) -> ExecutionResult<TimeoutOutcome> {
        let claimed = self.with_tracker(|sm| {
            if !matches!(sm.state(), State::Armed { .. }) {
                return false;
            }
            sm.handle(&TimeoutEvent::Fire);
            true
        })?;
        if !claimed {
            debug!(
                node_execution_id = %self.node_execution_id,
                timeout_instance_id = %instance.id,
                "Duplicate timeout delivery"
            );
            return Ok(TimeoutOutcome::Duplicate);
        }

        match self.expire(instance).await {
            Ok(outcome) => {
                let event = match outcome {
                    TimeoutOutcome::Dispatched | TimeoutOutcome::Duplicate => TimeoutEvent::Dispatch,
                    TimeoutOutcome::Ignored => TimeoutEvent::Ignore,
                };
                self.settle(event)?;
                Ok(outcome)
            }
            Err(e) => {
                error!(
                    node_execution_id = %self.node_execution_id,
                    timeout_instance_id = %instance.id,
                    error = %e,
                    "Timeout handling failed, re-arming"
                );
                self.settle(TimeoutEvent::Fail)?;
                Err(e)
            }
        }
    }

    async fn expire(&self, instance: &TimeoutInstance) -> ExecutionResult<TimeoutOutcome> {
        let node = self.node_service.get(&self.node_execution_id).await?;
        if !node.status.is_finalizable() || node.old_retry {
            info!(
                node_execution_id = %node.id,
                status = %node.status,
                "Deadline landed after node finished, ignoring"
            );
            return Ok(TimeoutOutcome::Ignored);
        }

        let details = match node.timeout_details {
            Some(details) => details,
            None => {
                let fresh = TimeoutDetails::new(&instance.id, Utc::now());
                match self
                    .node_service
                    .stamp_timeout_details(&node.id, fresh.clone())
                    .await?
                {
                    Some(_) => fresh,
                    // lost the stamp: the node finished or another delivery got there first
                    None => match self.node_service.get(&node.id).await?.timeout_details {
                        Some(details) => details,
                        None => return Ok(TimeoutOutcome::Ignored),
                    },
                }
            }
        };

        if details.timeout_instance_id != instance.id {
            warn!(
                node_execution_id = %node.id,
                expired_by = %details.timeout_instance_id,
                "Node already expired by another deadline"
            );
            return Ok(TimeoutOutcome::Ignored);
        }
        if let Some(interrupt_id) = &details.interrupt_id {
            debug!(
                node_execution_id = %node.id,
                interrupt_id = %interrupt_id,
                "Expiry interrupt already recorded for this deadline"
            );
            return Ok(TimeoutOutcome::Duplicate);
        }

        let interrupt_id = self
            .interrupts
            .register(Interrupt {
                kind: InterruptKind::MarkExpired,
                plan_execution_id: self.plan_execution_id.clone(),
                node_execution_id: Some(node.id.clone()),
                issued_by: IssuedBy::Timeout {
                    timeout_instance_id: instance.id.clone(),
                    issued_at: Utc::now(),
                },
            })
            .await?;

        if !self
            .node_service
            .record_timeout_interrupt(&node.id, &instance.id, &interrupt_id)
            .await?
        {
            warn!(
                node_execution_id = %node.id,
                interrupt_id = %interrupt_id,
                "Another delivery recorded an expiry interrupt first"
            );
        }

        self.metrics.record_interrupt_raised();
        info!(
            node_execution_id = %node.id,
            plan_execution_id = %self.plan_execution_id,
            interrupt_id = %interrupt_id,
            "Node expired, interrupt raised"
        );
        Ok(TimeoutOutcome::Dispatched)
    }
}

#[async_trait]
impl DeadlineHandler for TimeoutCallback {
    async fn on_deadline(&self, instance: TimeoutInstance) {
        if let Err(e) = self.on_timeout(&instance).await {
            warn!(timeout_instance_id = %instance.id, error = %e, "Deadline delivery failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MockInterruptManager;
    use crate::execution::mocks::{node, Harness, PLAN};
    use crate::execution::Status;
    use crate::store::NodeUpdate;

    fn instance(id: &str) -> TimeoutInstance {
        TimeoutInstance::new(id, Utc::now())
    }

    fn callback(h: &Harness, interrupts: MockInterruptManager) -> TimeoutCallback {
        TimeoutCallback::new(PLAN, "a", h.service.clone(), Arc::new(interrupts))
    }

    #[test]
    fn test_tracker_transitions() {
        let mut sm = TimeoutTracker::default().state_machine();
        sm.handle(&TimeoutEvent::Fire);
        assert_eq!(sm.state(), &State::fired());
        sm.handle(&TimeoutEvent::Fail);
        assert_eq!(sm.state(), &State::armed());
        sm.handle(&TimeoutEvent::Fire);
        sm.handle(&TimeoutEvent::Dispatch);
        assert_eq!(sm.state(), &State::dispatched());
        sm.handle(&TimeoutEvent::Fire);
        assert_eq!(sm.state(), &State::dispatched());
    }

    #[tokio::test]
    async fn test_running_node_is_stamped_and_interrupted() {
        let h = Harness::new();
        h.seed(vec![node("a", Status::Running)]).await;

        let mut interrupts = MockInterruptManager::new();
        interrupts
            .expect_register()
            .withf(|interrupt| {
                interrupt.kind == InterruptKind::MarkExpired
                    && interrupt.plan_execution_id == PLAN
                    && interrupt.node_execution_id.as_deref() == Some("a")
                    && matches!(
                        &interrupt.issued_by,
                        IssuedBy::Timeout { timeout_instance_id, .. } if timeout_instance_id == "deadline-1"
                    )
            })
            .times(1)
            .returning(|_| Ok("interrupt-1".to_string()));

        let callback = callback(&h, interrupts);
        let outcome = callback.on_timeout(&instance("deadline-1")).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::Dispatched);
        assert!(callback.is_dispatched());

        let stored = h.service.get("a").await.unwrap();
        let details = stored.timeout_details.unwrap();
        assert_eq!(details.timeout_instance_id, "deadline-1");
    }

    #[tokio::test]
    async fn test_duplicate_fire_is_harmless() {
        let h = Harness::new();
        h.seed(vec![node("a", Status::Running)]).await;

        let mut interrupts = MockInterruptManager::new();
        interrupts
            .expect_register()
            .times(1)
            .returning(|_| Ok("interrupt-1".to_string()));

        let callback = callback(&h, interrupts);
        callback.on_timeout(&instance("deadline-1")).await.unwrap();
        let first = h.service.get("a").await.unwrap().timeout_details;

        let outcome = callback.on_timeout(&instance("deadline-1")).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::Duplicate);
        assert_eq!(h.service.get("a").await.unwrap().timeout_details, first);
    }

    #[tokio::test]
    async fn test_finished_node_is_ignored() {
        let h = Harness::new();
        h.seed(vec![node("a", Status::Success)]).await;

        let mut interrupts = MockInterruptManager::new();
        interrupts.expect_register().never();

        let callback = callback(&h, interrupts);
        for _ in 0..2 {
            let outcome = callback.on_timeout(&instance("deadline-1")).await.unwrap();
            assert_ne!(outcome, TimeoutOutcome::Dispatched);
        }
        assert!(h.service.get("a").await.unwrap().timeout_details.is_none());
    }

    #[tokio::test]
    async fn test_node_expired_by_another_deadline_is_ignored() {
        let h = Harness::new();
        h.seed(vec![node("a", Status::Running)]).await;
        h.service
            .update(
                "a",
                NodeUpdate::new().set_timeout_details(TimeoutDetails::new("deadline-0", Utc::now())),
            )
            .await
            .unwrap();

        let mut interrupts = MockInterruptManager::new();
        interrupts.expect_register().never();

        let outcome = callback(&h, interrupts)
            .on_timeout(&instance("deadline-1"))
            .await
            .unwrap();
        assert_eq!(outcome, TimeoutOutcome::Ignored);
        let details = h.service.get("a").await.unwrap().timeout_details.unwrap();
        assert_eq!(details.timeout_instance_id, "deadline-0");
    }

    #[tokio::test]
    async fn test_failed_interrupt_rearms_without_restamping() {
        let h = Harness::new();
        h.seed(vec![node("a", Status::Running)]).await;

        let mut interrupts = MockInterruptManager::new();
        let mut seq = mockall::Sequence::new();
        interrupts
            .expect_register()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("interrupt queue unavailable")));
        interrupts
            .expect_register()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("interrupt-1".to_string()));

        let callback = callback(&h, interrupts);
        assert!(callback.on_timeout(&instance("deadline-1")).await.is_err());
        assert!(callback.is_armed());
        let stamped = h.service.get("a").await.unwrap();

        let outcome = callback.on_timeout(&instance("deadline-1")).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::Dispatched);
        let before = stamped.timeout_details.unwrap();
        let after = h.service.get("a").await.unwrap().timeout_details.unwrap();
        assert_eq!(after.expired_at, before.expired_at);
        assert_eq!(after.interrupt_id.as_deref(), Some("interrupt-1"));
    }

    #[tokio::test]
    async fn test_second_callback_for_same_deadline_raises_nothing() {
        let h = Harness::new();
        h.seed(vec![node("a", Status::Running)]).await;

        let mut first = MockInterruptManager::new();
        first
            .expect_register()
            .times(1)
            .returning(|_| Ok("interrupt-1".to_string()));
        let outcome = callback(&h, first)
            .on_timeout(&instance("deadline-1"))
            .await
            .unwrap();
        assert_eq!(outcome, TimeoutOutcome::Dispatched);

        // a fresh callback, as after a restart, sees the recorded interrupt
        let mut second = MockInterruptManager::new();
        second.expect_register().never();
        let restarted = callback(&h, second);
        let outcome = restarted.on_timeout(&instance("deadline-1")).await.unwrap();
        assert_eq!(outcome, TimeoutOutcome::Duplicate);
        assert!(restarted.is_dispatched());

        let details = h.service.get("a").await.unwrap().timeout_details.unwrap();
        assert_eq!(details.interrupt_id.as_deref(), Some("interrupt-1"));
    }

    #[tokio::test]
    async fn test_missing_node_surfaces_not_found() {
        let h = Harness::new();
        let callback = callback(&h, MockInterruptManager::new());
        let err = callback.on_timeout(&instance("deadline-1")).await.unwrap_err();
        assert!(matches!(err, ExecutionError::NotFound(_)));
        assert!(callback.is_armed());
    }
}
