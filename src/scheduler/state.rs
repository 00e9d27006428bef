use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::saga::{SagaEntry, SagaRecord, Transition};
use crate::scheduler::job::{Job, JobId, JobState, Task, TaskKey, TaskState};

/// In-memory job and task state, mutated only by folding saga entries.
///
/// The same [`SchedulerState::apply`] is used for live transitions and for
/// replay, so replaying a log reproduces exactly the state that wrote it.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerState {
    jobs: BTreeMap<JobId, Job>,
    last_seq: Option<u64>,
}

impl SchedulerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sequence of entries into a fresh state.
    pub fn replay<I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = Result<SagaEntry>>,
    {
        let mut state = Self::new();
        for entry in entries {
            state.apply(&entry?)?;
        }
        Ok(state)
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    pub fn task(&self, key: &TaskKey) -> Option<&Task> {
        self.jobs.get(&key.job_id)?.task(&key.task_id)
    }

    /// Runnable tasks of active jobs, oldest submission first, then in
    /// task order within the job.
    pub fn runnable_tasks(&self) -> Vec<(TaskKey, &Task)> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| j.state.is_active()).collect();
        jobs.sort_by_key(|j| (j.submitted_seq, j.id.clone()));
        jobs.into_iter()
            .flat_map(|job| {
                job.tasks
                    .iter()
                    .filter(|t| t.state == TaskState::Runnable)
                    .map(move |t| (TaskKey::new(job.id.clone(), t.id.clone()), t))
            })
            .collect()
    }

    /// Assigned or Running tasks of active jobs.
    pub fn outstanding_tasks(&self) -> Vec<(TaskKey, &Task)> {
        self.jobs
            .values()
            .filter(|j| j.state.is_active())
            .flat_map(|job| {
                job.tasks
                    .iter()
                    .filter(|t| t.state.is_outstanding())
                    .map(move |t| (TaskKey::new(job.id.clone(), t.id.clone()), t))
            })
            .collect()
    }

    pub fn jobs_in(&self, state: JobState) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|j| j.state == state)
            .map(|j| j.id.clone())
            .collect()
    }

    /// Entries that rebuild every non-terminal job, one per job. Each keeps
    /// the job's original submission sequence so placement order survives.
    pub fn snapshot_entries(&self) -> Vec<SagaEntry> {
        let mut jobs: Vec<&Job> = self
            .jobs
            .values()
            .filter(|j| !j.state.is_terminal())
            .collect();
        jobs.sort_by_key(|j| (j.submitted_seq, j.id.clone()));
        jobs.into_iter()
            .map(|job| SagaEntry {
                seq: job.submitted_seq,
                job_id: job.id.clone(),
                task_id: None,
                transition: Transition::JobSnapshot { job: job.clone() },
                timestamp: Utc::now(),
            })
            .collect()
    }

    /// Check that `record` is a legal transition from the current state.
    pub fn validate(&self, record: &SagaRecord) -> Result<()> {
        let job_id = record.job_id.as_str();
        let task_id = record.task_id.as_deref();
        let illegal = |reason: String| Err(SchedulerError::protocol(job_id, task_id, reason));

        match &record.transition {
            Transition::JobStarted { tasks, .. } => {
                if self.jobs.contains_key(job_id) {
                    return Err(SchedulerError::DuplicateJob(job_id.to_string()));
                }
                if tasks.is_empty() {
                    return illegal("job started without tasks".to_string());
                }
                return Ok(());
            }
            Transition::JobSnapshot { job } => {
                if self.jobs.contains_key(job_id) {
                    return Err(SchedulerError::DuplicateJob(job_id.to_string()));
                }
                if job.id != job_id {
                    return illegal(format!("snapshot carries job {}", job.id));
                }
                return Ok(());
            }
            _ => {}
        }

        let job = self
            .jobs
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;

        match &record.transition {
            Transition::JobCompensating { .. } => {
                if !job.state.is_active() {
                    return illegal(format!("cannot compensate a {} job", job.state));
                }
                return Ok(());
            }
            Transition::JobEnded { state } => {
                if job.state != JobState::Compensating {
                    return illegal(format!("cannot end a {} job", job.state));
                }
                if !state.is_terminal() {
                    return illegal(format!("job cannot end as {state}"));
                }
                return Ok(());
            }
            _ => {}
        }

        let Some(task_id) = task_id else {
            return illegal(format!("{} requires a task id", record.transition.name()));
        };
        let task = job.task(task_id).ok_or_else(|| SchedulerError::TaskNotFound {
            job_id: job_id.to_string(),
            task_id: task_id.to_string(),
        })?;
        if !job.state.is_active() {
            return illegal(format!(
                "{} on a {} job",
                record.transition.name(),
                job.state
            ));
        }

        let held_by = |worker: &str| task.assigned_worker.as_deref() == Some(worker);

        let legal = match &record.transition {
            Transition::TaskAssigned { attempt, .. } => {
                task.state == TaskState::Runnable && *attempt == task.attempt + 1
            }
            Transition::TaskRunning { worker_id } => {
                task.state == TaskState::Assigned && held_by(worker_id.as_str())
            }
            Transition::TaskCompleted { worker_id } => {
                task.state.is_outstanding() && held_by(worker_id.as_str())
            }
            Transition::TaskFailed {
                worker_id: Some(worker_id),
                ..
            } => task.state.is_outstanding() && held_by(worker_id.as_str()),
            Transition::TaskFailed { worker_id: None, .. } => !task.state.is_terminal(),
            Transition::TaskRequeued { .. } => task.state.is_outstanding(),
            _ => false,
        };

        if legal {
            Ok(())
        } else {
            illegal(format!(
                "{} not allowed from {} (held by {:?})",
                record.transition.name(),
                task.state,
                task.assigned_worker
            ))
        }
    }

    /// Validate and apply one sequenced entry.
    pub fn apply(&mut self, entry: &SagaEntry) -> Result<()> {
        if let Some(last) = self.last_seq {
            if entry.seq <= last {
                return Err(SchedulerError::protocol(
                    entry.job_id.clone(),
                    entry.task_id.as_deref(),
                    format!("entry {} replayed after {}", entry.seq, last),
                ));
            }
        }

        let record = SagaRecord {
            job_id: entry.job_id.clone(),
            task_id: entry.task_id.clone(),
            transition: entry.transition.clone(),
        };
        self.validate(&record)?;
        self.mutate(entry);
        self.last_seq = Some(entry.seq);
        Ok(())
    }

    fn mutate(&mut self, entry: &SagaEntry) {
        let at = entry.timestamp;

        match &entry.transition {
            Transition::JobStarted {
                tasks,
                retry_budget,
            } => {
                let job = Job {
                    id: entry.job_id.clone(),
                    tasks: tasks
                        .iter()
                        .map(|spec| Task::from_spec(spec, *retry_budget))
                        .collect(),
                    state: JobState::Pending,
                    submitted_seq: entry.seq,
                    submitted_at: at,
                    finished_at: None,
                    failure: None,
                };
                self.jobs.insert(job.id.clone(), job);
                return;
            }
            Transition::JobSnapshot { job } => {
                self.jobs.insert(job.id.clone(), job.clone());
                return;
            }
            _ => {}
        }

        let Some(job) = self.jobs.get_mut(&entry.job_id) else {
            return;
        };

        match &entry.transition {
            Transition::JobCompensating { reason } => begin_compensation(job, reason.clone()),
            Transition::JobEnded { state } => {
                job.state = *state;
                job.finished_at = Some(at);
            }
            transition => {
                let Some(task_id) = entry.task_id.as_deref() else {
                    return;
                };
                apply_task_transition(job, task_id, transition, at);
            }
        }
    }
}

fn apply_task_transition(job: &mut Job, task_id: &str, transition: &Transition, at: DateTime<Utc>) {
    let Some(task) = job.task_mut(task_id) else {
        return;
    };

    let mut exhausted = None;
    match transition {
        Transition::TaskAssigned { worker_id, attempt } => {
            task.state = TaskState::Assigned;
            task.assigned_worker = Some(worker_id.clone());
            task.attempt = *attempt;
        }
        Transition::TaskRunning { .. } => task.state = TaskState::Running,
        Transition::TaskCompleted { .. } => task.state = TaskState::Succeeded,
        Transition::TaskFailed {
            reason, retryable, ..
        } => {
            task.last_error = Some(reason.clone());
            if *retryable && task.has_retry_budget() {
                task.retry_count += 1;
                task.state = TaskState::Runnable;
                task.assigned_worker = None;
            } else {
                task.state = TaskState::Failed;
                exhausted = Some(format!(
                    "task {} failed after {} retries: {}",
                    task.id, task.retry_count, reason
                ));
            }
        }
        Transition::TaskRequeued { reason } => {
            task.state = TaskState::Runnable;
            task.assigned_worker = None;
            task.orphan_count += 1;
            task.last_error = Some(reason.clone());
        }
        _ => return,
    }

    if let Some(reason) = exhausted {
        begin_compensation(job, reason);
        return;
    }

    if job.state == JobState::Pending
        && job.tasks.iter().any(|t| t.state != TaskState::Runnable)
    {
        job.state = JobState::Running;
    }
    if job.all_succeeded() {
        job.state = JobState::Completed;
        job.finished_at = Some(at);
    }
}

/// Job enters Compensating; tasks that have not finished are aborted.
fn begin_compensation(job: &mut Job, reason: String) {
    job.state = JobState::Compensating;
    job.failure = Some(reason);
    for task in job.tasks.iter_mut().filter(|t| !t.state.is_terminal()) {
        task.state = TaskState::Failed;
        task.last_error = Some("aborted by compensation".to_string());
    }
}
