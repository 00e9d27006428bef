use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::WorkerId;
use crate::scheduler::job::{Job, JobId, JobState, TaskId, TaskSpec};

/// One state transition of a job's saga, with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transition {
    JobStarted {
        tasks: Vec<TaskSpec>,
        retry_budget: u32,
    },
    /// `attempt` numbers the task's assignments from 1.
    TaskAssigned {
        worker_id: WorkerId,
        #[serde(default)]
        attempt: u32,
    },
    TaskRunning {
        worker_id: WorkerId,
    },
    TaskCompleted {
        worker_id: WorkerId,
    },
    /// `worker_id` is `None` when the scheduler itself fails the task.
    TaskFailed {
        worker_id: Option<WorkerId>,
        reason: String,
        retryable: bool,
    },
    TaskRequeued {
        reason: String,
    },
    JobCompensating {
        reason: String,
    },
    /// Result of compensation: `Completed` or `Failed`.
    JobEnded {
        state: JobState,
    },
    /// Full job state written by compaction.
    JobSnapshot {
        job: Job,
    },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Transition::JobStarted { .. } => "job_started",
            Transition::TaskAssigned { .. } => "task_assigned",
            Transition::TaskRunning { .. } => "task_running",
            Transition::TaskCompleted { .. } => "task_completed",
            Transition::TaskFailed { .. } => "task_failed",
            Transition::TaskRequeued { .. } => "task_requeued",
            Transition::JobCompensating { .. } => "job_compensating",
            Transition::JobEnded { .. } => "job_ended",
            Transition::JobSnapshot { .. } => "job_snapshot",
        }
    }
}

/// A transition that has not been sequenced by the log yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaRecord {
    pub job_id: JobId,
    pub task_id: Option<TaskId>,
    pub transition: Transition,
}

impl SagaRecord {
    pub fn job(job_id: impl Into<JobId>, transition: Transition) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: None,
            transition,
        }
    }

    pub fn task(
        job_id: impl Into<JobId>,
        task_id: impl Into<TaskId>,
        transition: Transition,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: Some(task_id.into()),
            transition,
        }
    }

    pub(crate) fn sequence(self, seq: u64) -> SagaEntry {
        SagaEntry {
            seq,
            job_id: self.job_id,
            task_id: self.task_id,
            transition: self.transition,
            timestamp: Utc::now(),
        }
    }
}

/// An immutable, sequenced saga log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaEntry {
    pub seq: u64,
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    pub transition: Transition,
    pub timestamp: DateTime<Utc>,
}
