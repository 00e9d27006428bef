use serde::{Deserialize, Serialize};

use crate::cluster::{Resources, WorkerId};
use crate::scheduler::job::{JobId, TaskId, TaskKey};

/// Report from a worker about one task. Delivered at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub task_id: TaskId,
    /// Attempt number from the dispatch being reported on.
    pub attempt: u32,
    pub kind: WorkerEventKind,
}

impl WorkerEvent {
    pub fn new(
        worker_id: impl Into<WorkerId>,
        task: &TaskKey,
        attempt: u32,
        kind: WorkerEventKind,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_id: task.job_id.clone(),
            task_id: task.task_id.clone(),
            attempt,
            kind,
        }
    }

    pub fn task_key(&self) -> TaskKey {
        TaskKey::new(self.job_id.clone(), self.task_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEventKind {
    Started,
    Heartbeat,
    Succeeded,
    Failed { reason: String, retryable: bool },
}

/// How a worker event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// A transition was logged and applied.
    Applied,
    /// Liveness refreshed; no transition.
    Acknowledged,
    /// Repeat of a report already applied.
    Duplicate,
    /// Report about an assignment that no longer exists (re-queued,
    /// retried, archived, or the job is compensating).
    Stale,
}

/// Outbound instruction for the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerCommand {
    Dispatch {
        task: TaskKey,
        worker_id: WorkerId,
        attempt: u32,
        address: String,
        command: String,
        resources: Resources,
    },
    /// Out-of-band signal to stop a task the scheduler no longer wants.
    Cancel { task: TaskKey, worker_id: WorkerId },
}

impl WorkerCommand {
    pub fn task(&self) -> &TaskKey {
        match self {
            WorkerCommand::Dispatch { task, .. } | WorkerCommand::Cancel { task, .. } => task,
        }
    }
}
