use thiserror::Error;

use crate::saga::SagaLogError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    /// The saga log could not durably record a transition. The in-memory
    /// state was left untouched.
    #[error("Durability error: {0}")]
    Durability(#[from] SagaLogError),

    /// An illegal state transition was requested.
    #[error("Protocol error on job {job_id} task {task_id:?}: {reason}")]
    Protocol {
        job_id: String,
        task_id: Option<String>,
        reason: String,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Task not found: {job_id}/{task_id}")]
    TaskNotFound { job_id: String, task_id: String },

    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine cannot serve requests (loop stopped or recovery failed).
    #[error("Scheduler unavailable: {0}")]
    Unavailable(String),
}

impl SchedulerError {
    pub fn protocol(
        job_id: impl Into<String>,
        task_id: Option<&str>,
        reason: impl Into<String>,
    ) -> Self {
        SchedulerError::Protocol {
            job_id: job_id.into(),
            task_id: task_id.map(str::to_string),
            reason: reason.into(),
        }
    }

    /// Durability failures mean the engine cannot safely proceed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchedulerError::Durability(_) | SchedulerError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
