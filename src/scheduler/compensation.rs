use crate::scheduler::job::{Job, JobState, TaskState};

/// What compensation achieved for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// Consistency was restored; the job ends Completed.
    Restored,
    /// Nothing more can be done; the job ends Failed.
    Exhausted,
}

impl CompensationOutcome {
    pub fn final_state(self) -> JobState {
        match self {
            CompensationOutcome::Restored => JobState::Completed,
            CompensationOutcome::Exhausted => JobState::Failed,
        }
    }
}

/// Domain hook run synchronously when a job is Compensating.
///
/// The job passed in has already had its unfinished tasks aborted and
/// cancellation signals queued for their workers.
pub trait Compensator: Send {
    fn compensate(&mut self, job: &Job) -> CompensationOutcome;
}

/// Aborts outstanding work and never rolls back tasks that already
/// succeeded, so the job ends Failed.
#[derive(Debug, Default, Clone, Copy)]
pub struct AbortCompensator;

impl Compensator for AbortCompensator {
    fn compensate(&mut self, job: &Job) -> CompensationOutcome {
        let kept = job
            .tasks
            .iter()
            .filter(|t| t.state == TaskState::Succeeded)
            .count();
        tracing::info!(
            job_id = %job.id,
            succeeded_tasks = kept,
            reason = job.failure.as_deref().unwrap_or(""),
            "Compensation aborted outstanding work"
        );
        CompensationOutcome::Exhausted
    }
}

impl<F> Compensator for F
where
    F: FnMut(&Job) -> CompensationOutcome + Send,
{
    fn compensate(&mut self, job: &Job) -> CompensationOutcome {
        self(job)
    }
}
