// Node Execution Service
//
// Owns the persisted lifecycle of individual node executions. All status
// writes go through a store-level conditional update; there are no
// in-process locks around records.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use super::events::{
    EventEmitter, NodeExecutionObserver, ObserverSubject, OrchestrationEvent,
    OrchestrationEventType, StepStatusUpdate,
};
use super::status::Status;
use super::tree::ChildrenIndex;
use super::types::{InterruptEffect, InterruptKind, NodeExecution, TimeoutDetails};
use crate::collaborators::StepRegistry;
use crate::errors::{ExecutionError, ExecutionResult};
use crate::observability::{engine_metrics, EngineMetrics, OperationTimer};
use crate::store::{ExecutionStore, NodeQuery, NodeUpdate, UpdateAck};
use crate::telemetry::create_node_span;

pub struct NodeExecutionService {
    store: Arc<dyn ExecutionStore>,
    emitter: Arc<dyn EventEmitter>,
    step_registry: Option<Arc<dyn StepRegistry>>,
    observers: ObserverSubject,
    metrics: &'static EngineMetrics,
}

impl NodeExecutionService {
    pub fn new(store: Arc<dyn ExecutionStore>, emitter: Arc<dyn EventEmitter>) -> Self {
        Self {
            store,
            emitter,
            step_registry: None,
            observers: ObserverSubject::new(),
            metrics: engine_metrics(),
        }
    }

    pub fn with_step_registry(mut self, step_registry: Arc<dyn StepRegistry>) -> Self {
        self.step_registry = Some(step_registry);
        self
    }

    /// Add an in-process listener for start, status and update notifications
    pub fn register_observer(&self, observer: Arc<dyn NodeExecutionObserver>) {
        self.observers.register(observer);
    }

    // ---- reads -------------------------------------------------------------

    pub async fn get(&self, node_execution_id: &str) -> ExecutionResult<NodeExecution> {
        self.store
            .get(node_execution_id)
            .await?
            .ok_or_else(|| ExecutionError::NotFound(node_execution_id.to_string()))
    }

    /// Superseded retries are skipped. If more than one live record still
    /// matches, the first in store order wins and the ambiguity is logged.
    pub async fn get_by_plan_node_and_plan_execution(
        &self,
        plan_node_id: &str,
        plan_execution_id: &str,
    ) -> ExecutionResult<NodeExecution> {
        let query = NodeQuery::for_plan(plan_execution_id)
            .plan_node(plan_node_id)
            .old_retry(false);
        let mut found = self.store.find(&query).await?;
        if found.len() > 1 {
            warn!(
                plan_execution_id = %plan_execution_id,
                plan_node_id = %plan_node_id,
                matches = found.len(),
                "Multiple live node executions for plan node, using the first"
            );
        }
        if found.is_empty() {
            return Err(ExecutionError::NotFound(format!(
                "plan node {plan_node_id} in plan execution {plan_execution_id}"
            )));
        }
        Ok(found.swap_remove(0))
    }

    pub async fn fetch_by_plan(
        &self,
        plan_execution_id: &str,
        status_filter: Option<&[Status]>,
        exclude_old_retries: bool,
    ) -> ExecutionResult<Vec<NodeExecution>> {
        let mut query = NodeQuery::for_plan(plan_execution_id);
        if let Some(statuses) = status_filter {
            query = query.status_in(statuses);
        }
        if exclude_old_retries {
            query = query.old_retry(false);
        }
        Ok(self.store.find(&query).await?)
    }

    pub async fn fetch_without_old_retries(
        &self,
        plan_execution_id: &str,
    ) -> ExecutionResult<Vec<NodeExecution>> {
        self.fetch_by_plan(plan_execution_id, None, true).await
    }

    /// Live children of `parent_id`, most recent first
    pub async fn fetch_children(
        &self,
        plan_execution_id: &str,
        parent_id: &str,
    ) -> ExecutionResult<Vec<NodeExecution>> {
        let query = NodeQuery::for_plan(plan_execution_id)
            .parent(parent_id)
            .old_retry(false)
            .newest_first();
        Ok(self.store.find(&query).await?)
    }

    pub async fn fetch_by_notify_id(
        &self,
        plan_execution_id: &str,
        notify_id: &str,
        old_retry: bool,
    ) -> ExecutionResult<Vec<NodeExecution>> {
        let query = NodeQuery::for_plan(plan_execution_id)
            .notify(notify_id)
            .old_retry(old_retry)
            .newest_first();
        Ok(self.store.find(&query).await?)
    }

    pub async fn fetch_by_parent_id(
        &self,
        parent_id: &str,
        old_retry: bool,
    ) -> ExecutionResult<Vec<NodeExecution>> {
        let query = NodeQuery::new().parent(parent_id).old_retry(old_retry);
        Ok(self.store.find(&query).await?)
    }

    pub async fn find_count_by_parent_id_and_status_in(
        &self,
        parent_id: &str,
        statuses: &[Status],
    ) -> ExecutionResult<u64> {
        let query = NodeQuery::new()
            .parent(parent_id)
            .status_in(statuses)
            .old_retry(false);
        Ok(self.store.count(&query).await?)
    }

    /// Deadlines to cancel once a node is done; a skipped node never armed any
    pub async fn timeout_instance_ids(
        &self,
        status: Status,
        node_execution_id: &str,
    ) -> ExecutionResult<Vec<String>> {
        if status == Status::Skipped {
            return Ok(Vec::new());
        }
        Ok(self.get(node_execution_id).await?.timeout_instance_ids)
    }

    /// Resolved parameters interpreted by the step registered for the node's type
    pub async fn resolved_step_parameters(
        &self,
        node_execution_id: &str,
    ) -> ExecutionResult<Option<Value>> {
        let node = self.get(node_execution_id).await?;
        let Some(raw) = node.resolved_step_parameters.as_deref() else {
            return Ok(None);
        };
        let registry = self.step_registry.as_ref().ok_or_else(|| {
            ExecutionError::InvalidRequest("no step registry configured".to_string())
        })?;
        let step = registry.obtain(&node.step_type)?;
        Ok(Some(step.deserialize_parameters(raw)?))
    }

    /// Every live descendant of `root_id`, depth first, from a single read
    /// of the plan. The snapshot is not re-checked; callers acting on it
    /// must go through the guarded status path.
    pub async fn find_all_children_with_status_in(
        &self,
        plan_execution_id: &str,
        root_id: &str,
        status_filter: Option<&[Status]>,
        include_root: bool,
    ) -> ExecutionResult<Vec<NodeExecution>> {
        let span = create_node_span("find_all_children", plan_execution_id, Some(root_id));
        async move {
            let timer = OperationTimer::new("find_all_children_with_status_in");
            let snapshot = self
                .fetch_by_plan(plan_execution_id, status_filter, true)
                .await?;
            let found = ChildrenIndex::build(&snapshot).descendants(root_id, include_root);
            timer.finish();
            if let Err(e) = &found {
                error!(error = %e, "Tree walk failed");
            }
            found
        }
        .instrument(span)
        .await
    }

    // ---- writes ------------------------------------------------------------

    /// Unconditional merge-update of a live record. A miss means the record
    /// vanished; records superseded by a retry are refused.
    pub async fn update(
        &self,
        node_execution_id: &str,
        update: NodeUpdate,
    ) -> ExecutionResult<NodeExecution> {
        if update.status().is_some() {
            return Err(ExecutionError::InvalidRequest(
                "status changes must use update_status_with_ops".to_string(),
            ));
        }
        let filter = NodeQuery::by_id(node_execution_id).old_retry(false);
        if let Some(updated) = self.store.find_and_modify(&filter, &update).await? {
            self.publish_update(&updated).await;
            return Ok(updated);
        }

        match self.store.get(node_execution_id).await? {
            Some(stored) if stored.old_retry => {
                warn!(node_execution_id = %node_execution_id, "Refusing update of superseded record");
                Err(ExecutionError::Superseded {
                    id: node_execution_id.to_string(),
                })
            }
            _ => {
                error!(node_execution_id = %node_execution_id, "Unconditional update matched no record");
                Err(ExecutionError::UpdateFailed {
                    id: node_execution_id.to_string(),
                })
            }
        }
    }

    /// Guarded transition into `target`.
    ///
    /// The write only lands if the stored status is in the target's allowed
    /// predecessor set (or `override_predecessors`). A lost race returns
    /// `Ok(None)`, as does a record superseded by a retry. Final statuses
    /// are never accepted as predecessors, even through an override.
    pub async fn update_status_with_ops(
        &self,
        node_execution_id: &str,
        target: Status,
        ops: NodeUpdate,
        override_predecessors: Option<&[Status]>,
    ) -> ExecutionResult<Option<NodeExecution>> {
        let allowed: Vec<Status> = match override_predecessors {
            Some(statuses) => {
                let live: Vec<Status> = statuses.iter().copied().filter(|s| !s.is_final()).collect();
                if live.len() != statuses.len() {
                    warn!(
                        node_execution_id = %node_execution_id,
                        target = %target,
                        "Ignoring final statuses in predecessor override"
                    );
                }
                live
            }
            None => target.allowed_predecessors().to_vec(),
        };

        let mut update = ops.with_status(target);
        if target.is_final() && update.end_ts.is_none() {
            update = update.set_end_ts(Utc::now());
        }

        let filter = NodeQuery::by_id(node_execution_id)
            .status_in(&allowed)
            .old_retry(false);
        let Some(updated) = self.store.find_and_modify(&filter, &update).await? else {
            self.metrics.record_guard_miss();
            warn!(
                node_execution_id = %node_execution_id,
                target = %target,
                allowed = ?allowed,
                "Status guard missed, node already moved"
            );
            return Ok(None);
        };

        self.metrics.record_status_update();
        info!(
            node_execution_id = %updated.id,
            plan_execution_id = %updated.plan_execution_id,
            status = %updated.status,
            version = ?updated.version,
            "Node execution status updated"
        );
        self.publish_status(&updated).await;
        Ok(Some(updated))
    }

    /// Insert a never-persisted record, otherwise replace it whole under
    /// its version. A replace may not change the status or touch a
    /// superseded record.
    pub async fn save(&self, record: NodeExecution) -> ExecutionResult<NodeExecution> {
        if !record.is_persisted() {
            let saved = self.store.insert(record).await?;
            debug!(node_execution_id = %saved.id, "Node execution created");
            self.publish_start(&saved).await;
            return Ok(saved);
        }

        let id = record.id.clone();
        let Some(stored) = self.store.get(&id).await? else {
            error!(node_execution_id = %id, "Save matched no record");
            return Err(ExecutionError::UpdateFailed { id });
        };
        if stored.old_retry {
            warn!(node_execution_id = %id, "Refusing save of superseded record");
            return Err(ExecutionError::Superseded { id });
        }
        if stored.status != record.status {
            warn!(
                node_execution_id = %id,
                stored = %stored.status,
                requested = %record.status,
                "Refusing status change through save"
            );
            return Err(ExecutionError::InvalidRequest(format!(
                "save cannot move {id} from {} to {}; status changes must use update_status_with_ops",
                stored.status, record.status
            )));
        }

        let expected_version = record.version;
        match self.store.replace(record).await? {
            Some(saved) => {
                self.publish_update(&saved).await;
                Ok(saved)
            }
            None if self.store.get(&id).await?.is_some() => {
                warn!(node_execution_id = %id, expected_version = ?expected_version, "Stale save rejected");
                Err(ExecutionError::StaleRecord {
                    id,
                    expected_version,
                })
            }
            None => {
                error!(node_execution_id = %id, "Save matched no record");
                Err(ExecutionError::UpdateFailed { id })
            }
        }
    }

    pub async fn save_all(&self, records: Vec<NodeExecution>) -> ExecutionResult<Vec<NodeExecution>> {
        if let Some(persisted) = records.iter().find(|r| r.is_persisted()) {
            return Err(ExecutionError::InvalidRequest(format!(
                "save_all only inserts fresh records, {} is already persisted",
                persisted.id
            )));
        }
        let saved = self.store.insert_many(records).await?;
        for record in &saved {
            self.publish_start(record).await;
        }
        Ok(saved)
    }

    /// Force the given leaves into `Discontinuing` whatever their current
    /// status, recording the interrupt on each.
    pub async fn mark_leaves_discontinuing_on_abort(
        &self,
        interrupt_id: &str,
        interrupt_kind: InterruptKind,
        plan_execution_id: &str,
        leaf_ids: &[String],
    ) -> ExecutionResult<bool> {
        let filter = NodeQuery::for_plan(plan_execution_id)
            .ids(leaf_ids)
            .old_retry(false);
        let update = NodeUpdate::new()
            .with_status(Status::Discontinuing)
            .push_interrupt_history(InterruptEffect {
                interrupt_id: interrupt_id.to_string(),
                interrupt_kind,
                took_effect_at: Utc::now(),
            });
        Ok(self
            .force_status(filter, update, "mark_leaves_discontinuing_on_abort")
            .await?
            .is_some())
    }

    /// Bulk-force every non-final node of the plan into `Errored`
    pub async fn error_out_active_nodes(&self, plan_execution_id: &str) -> ExecutionResult<bool> {
        let filter = NodeQuery::for_plan(plan_execution_id)
            .status_in(Status::active_statuses())
            .old_retry(false);
        let update = NodeUpdate::new()
            .with_status(Status::Errored)
            .set_end_ts(Utc::now());
        Ok(self
            .force_status(filter, update, "error_out_active_nodes")
            .await?
            .is_some())
    }

    /// Bulk-force nodes in `statuses` (and every queued node) into
    /// `Discontinuing`; returns how many changed.
    pub async fn mark_all_leaves_and_queued_nodes_discontinuing(
        &self,
        plan_execution_id: &str,
        statuses: &[Status],
    ) -> ExecutionResult<u64> {
        let mut targets = statuses.to_vec();
        if !targets.contains(&Status::Queued) {
            targets.push(Status::Queued);
        }
        let filter = NodeQuery::for_plan(plan_execution_id)
            .status_in(&targets)
            .old_retry(false);
        let update = NodeUpdate::new().with_status(Status::Discontinuing);
        Ok(self
            .force_status(filter, update, "mark_all_leaves_and_queued_nodes_discontinuing")
            .await?
            .map_or(0, |ack| ack.modified))
    }

    /// Flag a record as superseded by a newer attempt
    pub async fn mark_retried(&self, node_execution_id: &str) -> ExecutionResult<bool> {
        let update = NodeUpdate::new().set_old_retry(true);
        match self
            .store
            .find_and_modify(&NodeQuery::by_id(node_execution_id), &update)
            .await?
        {
            Some(updated) => {
                self.publish_update(&updated).await;
                Ok(true)
            }
            None => {
                warn!(node_execution_id = %node_execution_id, "Cannot mark retried, record not found");
                Ok(false)
            }
        }
    }

    /// Re-point every record whose `previous_id` is `old_id` at `new_id`.
    ///
    /// The new attempt is left out of the rewrite: it is normally created
    /// with `previous_id == old_id`, and rewriting it would leave it
    /// pointing at itself. Superseded records are rewritten too, which keeps
    /// the chain intact through repeated retries.
    pub async fn update_relationships_for_retry_node(
        &self,
        old_id: &str,
        new_id: &str,
    ) -> ExecutionResult<bool> {
        let filter = NodeQuery::new().previous(old_id).excluding(new_id);
        let update = NodeUpdate::new().set_previous_id(new_id);
        let ack = self.store.update_many(&filter, &update).await?;
        if !ack.acknowledged {
            error!(old_id = %old_id, new_id = %new_id, "Retry relationship rewrite not acknowledged");
            return Ok(false);
        }
        debug!(old_id = %old_id, new_id = %new_id, modified = ack.modified, "Retry chain rewritten");
        Ok(true)
    }

    /// Stamp the first expiry onto a live node that has not finished.
    /// `None` when the node finished, was superseded, or another deadline
    /// stamped it first.
    pub async fn stamp_timeout_details(
        &self,
        node_execution_id: &str,
        details: TimeoutDetails,
    ) -> ExecutionResult<Option<NodeExecution>> {
        let filter = NodeQuery::by_id(node_execution_id)
            .status_in(Status::finalizable_statuses())
            .old_retry(false)
            .unexpired();
        let update = NodeUpdate::new().set_timeout_details(details);
        let stamped = self.store.find_and_modify(&filter, &update).await?;
        if let Some(updated) = &stamped {
            self.publish_update(updated).await;
        }
        Ok(stamped)
    }

    /// Record the interrupt raised for a deadline. False when an interrupt
    /// was already recorded for it.
    pub async fn record_timeout_interrupt(
        &self,
        node_execution_id: &str,
        timeout_instance_id: &str,
        interrupt_id: &str,
    ) -> ExecutionResult<bool> {
        let filter = NodeQuery::by_id(node_execution_id).awaiting_timeout_interrupt(timeout_instance_id);
        let update = NodeUpdate::new().set_timeout_interrupt(interrupt_id);
        match self.store.find_and_modify(&filter, &update).await? {
            Some(updated) => {
                self.publish_update(&updated).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---- internals ---------------------------------------------------------

    /// Bulk status override. Events are published for every record that
    /// ended up in the target status.
    async fn force_status(
        &self,
        filter: NodeQuery,
        update: NodeUpdate,
        operation: &str,
    ) -> ExecutionResult<Option<UpdateAck>> {
        let Some(target) = update.status() else {
            return Err(ExecutionError::InvalidRequest(format!(
                "{operation} requires a target status"
            )));
        };
        let candidates: Vec<String> = self
            .store
            .find(&filter)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();

        let ack = self.store.update_many(&filter, &update).await?;
        if !ack.acknowledged {
            error!(operation = %operation, "Bulk status update not acknowledged");
            return Ok(None);
        }
        info!(
            operation = %operation,
            target = %target,
            matched = ack.matched,
            modified = ack.modified,
            "Bulk status update applied"
        );

        if !candidates.is_empty() {
            let changed = self
                .store
                .find(&NodeQuery::new().ids(&candidates).status_in(&[target]))
                .await?;
            for record in &changed {
                self.metrics.record_status_update();
                self.publish_status(record).await;
            }
        }
        Ok(Some(ack))
    }

    async fn emit(&self, event_type: OrchestrationEventType, record: &NodeExecution) {
        match self
            .emitter
            .emit(OrchestrationEvent::new(event_type, record))
            .await
        {
            Ok(()) => self.metrics.record_event_emitted(),
            Err(e) => {
                self.metrics.record_emit_failure();
                warn!(
                    node_execution_id = %record.id,
                    event_type = ?event_type,
                    error = %e,
                    "Failed to emit orchestration event"
                );
            }
        }
    }

    async fn publish_start(&self, record: &NodeExecution) {
        self.emit(OrchestrationEventType::NodeExecutionStart, record).await;
        self.observers.fire_start(record);
    }

    async fn publish_update(&self, record: &NodeExecution) {
        self.emit(OrchestrationEventType::NodeExecutionUpdate, record).await;
        self.observers.fire_update(record);
    }

    async fn publish_status(&self, record: &NodeExecution) {
        self.emit(OrchestrationEventType::NodeExecutionStatusUpdate, record)
            .await;
        self.observers.fire_status_update(&StepStatusUpdate {
            node_execution_id: record.id.clone(),
            plan_execution_id: record.plan_execution_id.clone(),
            status: record.status,
            updated_at: record.last_updated_at,
        });
    }
}
