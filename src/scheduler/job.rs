use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{Resources, WorkerId};
use crate::error::{Result, SchedulerError};

pub type JobId = String;
pub type TaskId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Pending or Running: the job still accepts task transitions.
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Pending | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Failed => write!(f, "failed"),
            JobState::Compensating => write!(f, "compensating"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Runnable,
    Assigned,
    Running,
    Succeeded,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed)
    }

    /// Assigned or Running: a worker holds (or may hold) this task.
    pub fn is_outstanding(self) -> bool {
        matches!(self, TaskState::Assigned | TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Runnable => write!(f, "runnable"),
            TaskState::Assigned => write!(f, "assigned"),
            TaskState::Running => write!(f, "running"),
            TaskState::Succeeded => write!(f, "succeeded"),
            TaskState::Failed => write!(f, "failed"),
        }
    }
}

/// Globally unique task address: a task id is only unique within its job.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub job_id: JobId,
    pub task_id: TaskId,
}

impl TaskKey {
    pub fn new(job_id: impl Into<JobId>, task_id: impl Into<TaskId>) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.job_id, self.task_id)
    }
}

/// A task as submitted. Recorded verbatim in the `JobStarted` saga entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub resources: Resources,
}

impl TaskSpec {
    pub fn new(id: impl Into<TaskId>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            resources: Resources::default(),
        }
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}

/// A job submission request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Caller-supplied id. A UUID is generated when absent.
    #[serde(default)]
    pub id: Option<JobId>,
    pub tasks: Vec<TaskSpec>,
    /// Per-task retry budget override.
    #[serde(default)]
    pub retry_budget: Option<u32>,
}

impl JobSpec {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self {
            id: None,
            tasks,
            retry_budget: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<JobId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = Some(budget);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(id) = &self.id {
            if id.is_empty() {
                return Err(SchedulerError::InvalidJob("job id is empty".to_string()));
            }
        }
        if self.tasks.is_empty() {
            return Err(SchedulerError::InvalidJob("job has no tasks".to_string()));
        }
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if task.id.is_empty() {
                return Err(SchedulerError::InvalidJob("task id is empty".to_string()));
            }
            if !seen.insert(task.id.as_str()) {
                return Err(SchedulerError::InvalidJob(format!(
                    "duplicate task id {}",
                    task.id
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub command: String,
    pub resources: Resources,
    pub state: TaskState,
    /// Lookup key into the cluster view. Set while outstanding, and kept on
    /// terminal states as the worker that produced the result.
    pub assigned_worker: Option<WorkerId>,
    /// Number of the latest assignment. Reports carry it so a late report
    /// from an earlier attempt is never taken for the current one.
    #[serde(default)]
    pub attempt: u32,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Times the task was re-queued after losing its worker.
    pub orphan_count: u32,
    pub last_error: Option<String>,
}

impl Task {
    pub fn from_spec(spec: &TaskSpec, max_retries: u32) -> Self {
        Self {
            id: spec.id.clone(),
            command: spec.command.clone(),
            resources: spec.resources.clone(),
            state: TaskState::Runnable,
            assigned_worker: None,
            attempt: 0,
            retry_count: 0,
            max_retries,
            orphan_count: 0,
            last_error: None,
        }
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tasks: Vec<Task>,
    pub state: JobState,
    /// Sequence number of the `JobStarted` entry; orders placement.
    pub submitted_seq: u64,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure: Option<String>,
}

impl Job {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == task_id)
    }

    pub fn all_succeeded(&self) -> bool {
        self.tasks.iter().all(|t| t.state == TaskState::Succeeded)
    }

    /// Outstanding tasks with the worker holding each of them.
    pub fn outstanding(&self) -> Vec<(TaskKey, WorkerId)> {
        self.tasks
            .iter()
            .filter(|t| t.state.is_outstanding())
            .filter_map(|t| {
                t.assigned_worker
                    .clone()
                    .map(|w| (TaskKey::new(self.id.clone(), t.id.clone()), w))
            })
            .collect()
    }
}
