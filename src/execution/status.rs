// Node status set and the allowed-transition table

use serde::{Deserialize, Serialize};
use std::fmt;

/// Run-time status of a single node execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    Discontinuing,
    Paused,
    Expired,
    Aborted,
    Skipped,
    Failed,
    Errored,
    Success,
}

const ALL: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::Discontinuing,
    Status::Paused,
    Status::Expired,
    Status::Aborted,
    Status::Skipped,
    Status::Failed,
    Status::Errored,
    Status::Success,
];

const FINAL: &[Status] = &[
    Status::Expired,
    Status::Aborted,
    Status::Skipped,
    Status::Failed,
    Status::Errored,
    Status::Success,
];

/// Statuses a running deadline may still act on
const FINALIZABLE: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::Paused,
];

/// Statuses of a node that is still in flight, including one being torn down
const ACTIVE: &[Status] = &[
    Status::Queued,
    Status::Running,
    Status::AsyncWaiting,
    Status::TaskWaiting,
    Status::Discontinuing,
    Status::Paused,
];

impl Status {
    pub fn all() -> &'static [Status] {
        ALL
    }

    pub fn final_statuses() -> &'static [Status] {
        FINAL
    }

    pub fn finalizable_statuses() -> &'static [Status] {
        FINALIZABLE
    }

    pub fn active_statuses() -> &'static [Status] {
        ACTIVE
    }

    /// Statuses a node must currently hold for a move into `self` to be legal.
    /// Terminal statuses never appear here, so a finished node can't be resurrected.
    pub fn allowed_predecessors(self) -> &'static [Status] {
        match self {
            Status::Queued => &[Status::Paused],
            Status::Running => &[
                Status::Queued,
                Status::AsyncWaiting,
                Status::TaskWaiting,
                Status::Paused,
            ],
            Status::AsyncWaiting => &[Status::Running, Status::Paused],
            Status::TaskWaiting => &[Status::Running, Status::Paused],
            Status::Discontinuing => &[
                Status::Running,
                Status::AsyncWaiting,
                Status::TaskWaiting,
                Status::Paused,
            ],
            Status::Paused => &[
                Status::Queued,
                Status::Running,
                Status::AsyncWaiting,
                Status::TaskWaiting,
            ],
            Status::Expired => &[
                Status::Queued,
                Status::Running,
                Status::AsyncWaiting,
                Status::TaskWaiting,
                Status::Discontinuing,
                Status::Paused,
            ],
            Status::Aborted => &[Status::Queued, Status::Discontinuing, Status::Paused],
            Status::Skipped => &[Status::Queued],
            Status::Failed | Status::Errored | Status::Success => &[
                Status::Running,
                Status::AsyncWaiting,
                Status::TaskWaiting,
                Status::Discontinuing,
            ],
        }
    }

    pub fn is_final(self) -> bool {
        FINAL.contains(&self)
    }

    pub fn is_finalizable(self) -> bool {
        FINALIZABLE.contains(&self)
    }

    pub fn can_transition_to(self, target: Status) -> bool {
        target.allowed_predecessors().contains(&self)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::Discontinuing => "DISCONTINUING",
            Status::Paused => "PAUSED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::Failed => "FAILED",
            Status::Errored => "ERRORED",
            Status::Success => "SUCCESS",
        };
        f.write_str(name)
    }
}
