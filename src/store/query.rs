// Filter and mutation documents understood by every ExecutionStore

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::execution::status::Status;
use crate::execution::types::{
    ExecutableResponse, FailureInfo, InterruptEffect, NodeExecution, TimeoutDetails,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Sort {
    /// Store order (insertion order for the bundled stores)
    #[default]
    Natural,
    CreatedAtDesc,
}

/// Predicate on a record's `timeout_details`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutFilter {
    /// No deadline has expired the record yet
    Unstamped,
    /// Expired by this deadline, interrupt not yet recorded
    AwaitingInterrupt(String),
}

/// Conjunction of field predicates; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeQuery {
    pub id: Option<String>,
    pub ids: Option<Vec<String>>,
    pub exclude_id: Option<String>,
    pub plan_execution_id: Option<String>,
    pub plan_node_id: Option<String>,
    pub parent_id: Option<String>,
    pub notify_id: Option<String>,
    pub previous_id: Option<String>,
    pub status_in: Option<Vec<Status>>,
    pub old_retry: Option<bool>,
    pub timeout: Option<TimeoutFilter>,
    pub sort: Sort,
}

impl NodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_plan(plan_execution_id: &str) -> Self {
        Self {
            plan_execution_id: Some(plan_execution_id.to_string()),
            ..Default::default()
        }
    }

    pub fn ids(mut self, ids: &[String]) -> Self {
        self.ids = Some(ids.to_vec());
        self
    }

    pub fn excluding(mut self, id: &str) -> Self {
        self.exclude_id = Some(id.to_string());
        self
    }

    pub fn plan_node(mut self, plan_node_id: &str) -> Self {
        self.plan_node_id = Some(plan_node_id.to_string());
        self
    }

    pub fn parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn notify(mut self, notify_id: &str) -> Self {
        self.notify_id = Some(notify_id.to_string());
        self
    }

    pub fn previous(mut self, previous_id: &str) -> Self {
        self.previous_id = Some(previous_id.to_string());
        self
    }

    pub fn status_in(mut self, statuses: &[Status]) -> Self {
        self.status_in = Some(statuses.to_vec());
        self
    }

    pub fn old_retry(mut self, old_retry: bool) -> Self {
        self.old_retry = Some(old_retry);
        self
    }

    pub fn unexpired(mut self) -> Self {
        self.timeout = Some(TimeoutFilter::Unstamped);
        self
    }

    pub fn awaiting_timeout_interrupt(mut self, timeout_instance_id: &str) -> Self {
        self.timeout = Some(TimeoutFilter::AwaitingInterrupt(
            timeout_instance_id.to_string(),
        ));
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.sort = Sort::CreatedAtDesc;
        self
    }

    pub fn matches(&self, record: &NodeExecution) -> bool {
        fn eq_opt(expected: &Option<String>, actual: Option<&str>) -> bool {
            match expected {
                Some(value) => actual == Some(value.as_str()),
                None => true,
            }
        }

        if let Some(id) = &self.id {
            if &record.id != id {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&record.id) {
                return false;
            }
        }
        if self.exclude_id.as_deref() == Some(record.id.as_str()) {
            return false;
        }
        if let Some(plan) = &self.plan_execution_id {
            if &record.plan_execution_id != plan {
                return false;
            }
        }
        if let Some(plan_node) = &self.plan_node_id {
            if &record.plan_node_id != plan_node {
                return false;
            }
        }
        if !eq_opt(&self.parent_id, record.parent_id.as_deref())
            || !eq_opt(&self.notify_id, record.notify_id.as_deref())
            || !eq_opt(&self.previous_id, record.previous_id.as_deref())
        {
            return false;
        }
        if let Some(statuses) = &self.status_in {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        if let Some(old_retry) = self.old_retry {
            if record.old_retry != old_retry {
                return false;
            }
        }
        match (&self.timeout, &record.timeout_details) {
            (None, _) => true,
            (Some(TimeoutFilter::Unstamped), details) => details.is_none(),
            (Some(TimeoutFilter::AwaitingInterrupt(_)), None) => false,
            (Some(TimeoutFilter::AwaitingInterrupt(id)), Some(details)) => {
                &details.timeout_instance_id == id && details.interrupt_id.is_none()
            }
        }
    }
}

/// Merge-update applied to a single stored record.
/// Every applied update bumps `version` and stamps `last_updated_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeUpdate {
    pub(crate) status: Option<Status>,
    pub push_executable_responses: Vec<ExecutableResponse>,
    pub push_retry_ids: Vec<String>,
    pub push_timeout_instance_ids: Vec<String>,
    pub push_interrupt_histories: Vec<InterruptEffect>,
    pub timeout_details: Option<TimeoutDetails>,
    pub timeout_interrupt_id: Option<String>,
    pub old_retry: Option<bool>,
    pub previous_id: Option<String>,
    pub resolved_step_parameters: Option<String>,
    pub failure_info: Option<FailureInfo>,
    pub progress_data: Option<Value>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status changes are only built inside the crate so that every
    /// status write passes through a guard or an explicit bulk override.
    pub(crate) fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn push_executable_response(mut self, response: ExecutableResponse) -> Self {
        self.push_executable_responses.push(response);
        self
    }

    pub fn push_retry_id(mut self, retry_id: &str) -> Self {
        self.push_retry_ids.push(retry_id.to_string());
        self
    }

    pub fn push_timeout_instance_id(mut self, timeout_instance_id: &str) -> Self {
        self.push_timeout_instance_ids
            .push(timeout_instance_id.to_string());
        self
    }

    pub fn push_interrupt_history(mut self, effect: InterruptEffect) -> Self {
        self.push_interrupt_histories.push(effect);
        self
    }

    pub fn set_timeout_details(mut self, details: TimeoutDetails) -> Self {
        self.timeout_details = Some(details);
        self
    }

    /// Record the expiry interrupt on already-stamped timeout details
    pub fn set_timeout_interrupt(mut self, interrupt_id: &str) -> Self {
        self.timeout_interrupt_id = Some(interrupt_id.to_string());
        self
    }

    pub fn set_old_retry(mut self, old_retry: bool) -> Self {
        self.old_retry = Some(old_retry);
        self
    }

    pub fn set_previous_id(mut self, previous_id: &str) -> Self {
        self.previous_id = Some(previous_id.to_string());
        self
    }

    pub fn set_resolved_step_parameters(mut self, parameters: &str) -> Self {
        self.resolved_step_parameters = Some(parameters.to_string());
        self
    }

    pub fn set_failure_info(mut self, failure_info: FailureInfo) -> Self {
        self.failure_info = Some(failure_info);
        self
    }

    pub fn set_progress_data(mut self, progress: Value) -> Self {
        self.progress_data = Some(progress);
        self
    }

    pub fn set_start_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.start_ts = Some(ts);
        self
    }

    pub fn set_end_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.end_ts = Some(ts);
        self
    }

    pub fn apply(&self, record: &mut NodeExecution, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            record.status = status;
        }
        record
            .executable_responses
            .extend(self.push_executable_responses.iter().cloned());
        record.retry_ids.extend(self.push_retry_ids.iter().cloned());
        record
            .timeout_instance_ids
            .extend(self.push_timeout_instance_ids.iter().cloned());
        record
            .interrupt_histories
            .extend(self.push_interrupt_histories.iter().cloned());
        if let Some(details) = &self.timeout_details {
            record.timeout_details = Some(details.clone());
        }
        if let (Some(interrupt_id), Some(details)) =
            (&self.timeout_interrupt_id, record.timeout_details.as_mut())
        {
            details.interrupt_id = Some(interrupt_id.clone());
        }
        if let Some(old_retry) = self.old_retry {
            record.old_retry = old_retry;
        }
        if let Some(previous_id) = &self.previous_id {
            record.previous_id = Some(previous_id.clone());
        }
        if let Some(parameters) = &self.resolved_step_parameters {
            record.resolved_step_parameters = Some(parameters.clone());
        }
        if let Some(failure_info) = &self.failure_info {
            record.failure_info = Some(failure_info.clone());
        }
        if let Some(progress) = &self.progress_data {
            record.progress_data = Some(progress.clone());
        }
        if let Some(ts) = self.start_ts {
            record.start_ts = Some(ts);
        }
        if let Some(ts) = self.end_ts {
            record.end_ts = Some(ts);
        }
        record.last_updated_at = now;
        record.version = Some(record.version.map_or(0, |v| v + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::types::{Ambiance, StepCategory, StepType};

    fn node(id: &str, status: Status) -> NodeExecution {
        NodeExecution::new(
            Ambiance::new("plan-1"),
            "plan-node",
            id,
            StepType::new("DUMMY", StepCategory::Step),
        )
        .with_id(id)
        .with_status(status)
    }

    #[test]
    fn test_query_matches_all_predicates() {
        let record = node("a", Status::Running).with_parent("root");
        let query = NodeQuery::for_plan("plan-1")
            .parent("root")
            .status_in(&[Status::Running, Status::Paused])
            .old_retry(false);
        assert!(query.matches(&record));

        assert!(!NodeQuery::for_plan("plan-2").matches(&record));
        assert!(!NodeQuery::new().parent("other").matches(&record));
        assert!(!NodeQuery::new().status_in(&[Status::Queued]).matches(&record));
        assert!(!NodeQuery::new().old_retry(true).matches(&record));
    }

    #[test]
    fn test_empty_status_filter_matches_nothing() {
        let record = node("a", Status::Running);
        assert!(!NodeQuery::new().status_in(&[]).matches(&record));
    }

    #[test]
    fn test_timeout_filters() {
        let mut record = node("a", Status::Running);
        assert!(NodeQuery::new().unexpired().matches(&record));
        assert!(!NodeQuery::new().awaiting_timeout_interrupt("d1").matches(&record));

        record.timeout_details = Some(TimeoutDetails::new("d1", Utc::now()));
        assert!(!NodeQuery::new().unexpired().matches(&record));
        assert!(NodeQuery::new().awaiting_timeout_interrupt("d1").matches(&record));
        assert!(!NodeQuery::new().awaiting_timeout_interrupt("d2").matches(&record));

        record.timeout_details = record.timeout_details.map(|d| d.with_interrupt("i1"));
        assert!(!NodeQuery::new().awaiting_timeout_interrupt("d1").matches(&record));
    }

    #[test]
    fn test_apply_stamps_version_and_timestamp() {
        let mut record = node("a", Status::Running);
        record.version = Some(3);
        let before = record.last_updated_at;
        let now = before + chrono::Duration::seconds(5);

        NodeUpdate::new()
            .with_status(Status::AsyncWaiting)
            .push_executable_response(ExecutableResponse::Async {
                callback_ids: vec!["cb".to_string()],
            })
            .apply(&mut record, now);

        assert_eq!(record.status, Status::AsyncWaiting);
        assert_eq!(record.version, Some(4));
        assert_eq!(record.last_updated_at, now);
        assert_eq!(record.executable_responses.len(), 1);
    }

    #[test]
    fn test_apply_appends_rather_than_replaces_responses() {
        let mut record = node("a", Status::Running);
        let first = ExecutableResponse::Child {
            child_id: "c1".to_string(),
        };
        let second = ExecutableResponse::Child {
            child_id: "c2".to_string(),
        };
        NodeUpdate::new()
            .push_executable_response(first.clone())
            .apply(&mut record, Utc::now());
        NodeUpdate::new()
            .push_executable_response(second.clone())
            .apply(&mut record, Utc::now());
        assert_eq!(record.executable_responses, vec![first, second]);
    }
}
