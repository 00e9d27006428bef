use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::cluster::{ClusterView, MembershipEvent, WorkerHealth, WorkerId};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::saga::{SagaEntry, SagaLog, SagaRecord, Transition};
use crate::scheduler::assigner::{Assignment, PlacementAlgorithm, PlacementRequest};
use crate::scheduler::compensation::Compensator;
use crate::scheduler::events::{EventOutcome, WorkerCommand, WorkerEvent, WorkerEventKind};
use crate::scheduler::job::{Job, JobId, JobSpec, JobState, TaskKey, TaskState};
use crate::scheduler::state::SchedulerState;
use crate::stats;

/// Volatile per-task clocks. Not logged; reset on recovery.
#[derive(Debug, Clone, Copy)]
struct TaskTimer {
    /// When the task entered its current state.
    since: Instant,
    last_progress: Instant,
}

impl TaskTimer {
    fn at(now: Instant) -> Self {
        Self {
            since: now,
            last_progress: now,
        }
    }
}

/// Finished jobs kept after compaction drops them from state.
const ARCHIVE_CAPACITY: usize = 4096;

/// Jobs removed from state by compaction, so that late worker reports for
/// them are still recognised as duplicates. Oldest are forgotten first.
#[derive(Debug, Default)]
struct Archive {
    jobs: HashMap<JobId, Job>,
    order: VecDeque<JobId>,
}

impl Archive {
    fn insert(&mut self, job: Job) {
        let id = job.id.clone();
        if self.jobs.insert(id.clone(), job).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > ARCHIVE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.jobs.remove(&oldest);
            }
        }
    }

    fn get(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    fn contains(&self, job_id: &str) -> bool {
        self.jobs.contains_key(job_id)
    }
}

/// Summary of one scheduling pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    pub assigned: usize,
    pub deferred: usize,
    pub orphaned: usize,
    pub compacted: bool,
}

/// Summary of startup recovery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub entries_replayed: u64,
    pub jobs_recovered: usize,
    pub tasks_requeued: usize,
    pub jobs_compensated: usize,
    pub duration: Duration,
}

/// Single owner of job and task state.
///
/// Every mutation goes through [`Scheduler::commit`]: validate against the
/// current state, append to the saga log, then apply in memory. Nothing is
/// applied that was not durably logged.
pub struct Scheduler {
    config: SchedulerConfig,
    state: SchedulerState,
    cluster: ClusterView,
    log: Arc<dyn SagaLog>,
    placement: Box<dyn PlacementAlgorithm>,
    compensator: Box<dyn Compensator>,
    archive: Archive,
    timers: HashMap<TaskKey, TaskTimer>,
    commands: Vec<WorkerCommand>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.state.job_count())
            .field("workers", &self.cluster.len())
            .field("placement", &self.placement.name())
            .field("log_len", &self.log.len())
            .field("archived", &self.archive.order.len())
            .finish()
    }
}

impl Scheduler {
    pub(crate) fn new(
        config: SchedulerConfig,
        state: SchedulerState,
        cluster: ClusterView,
        log: Arc<dyn SagaLog>,
        placement: Box<dyn PlacementAlgorithm>,
        compensator: Box<dyn Compensator>,
    ) -> Self {
        Self {
            config,
            state,
            cluster,
            log,
            placement,
            compensator,
            archive: Archive::default(),
            timers: HashMap::new(),
            commands: Vec::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    pub fn cluster(&self) -> &ClusterView {
        &self.cluster
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.state.job(job_id)
    }

    pub fn queue_depth(&self) -> usize {
        self.state.runnable_tasks().len()
    }

    /// Drain commands produced since the last call, in order.
    pub fn take_commands(&mut self) -> Vec<WorkerCommand> {
        std::mem::take(&mut self.commands)
    }

    fn commit(&mut self, record: SagaRecord) -> Result<SagaEntry> {
        self.state.validate(&record)?;
        let entry = self.log.append(record).map_err(|e| {
            tracing::error!(error = %e, "Saga log append failed");
            SchedulerError::from(e)
        })?;
        self.state.apply(&entry)?;
        Ok(entry)
    }

    pub fn submit_job(&mut self, spec: JobSpec) -> Result<JobId> {
        spec.validate()?;
        let job_id = spec
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.state.job(&job_id).is_some() || self.archive.contains(&job_id) {
            return Err(SchedulerError::DuplicateJob(job_id));
        }

        let retry_budget = spec.retry_budget.unwrap_or(self.config.retry_budget);
        let task_count = spec.tasks.len();
        let entry = self.commit(SagaRecord::job(
            job_id.clone(),
            Transition::JobStarted {
                tasks: spec.tasks,
                retry_budget,
            },
        ))?;

        let now = Instant::now();
        if let Some(job) = self.state.job(&job_id) {
            for task in &job.tasks {
                self.timers
                    .insert(TaskKey::new(job_id.clone(), task.id.clone()), TaskTimer::at(now));
            }
        }

        stats::record_job_submitted();
        tracing::info!(job_id = %job_id, tasks = task_count, seq = entry.seq, "Job submitted");
        Ok(job_id)
    }

    /// Cancel a job: log it as Compensating, signal outstanding tasks, and
    /// run compensation. Cancelling a job that is already compensating is a
    /// no-op; cancelling a finished job is a protocol error.
    pub fn cancel_job(&mut self, job_id: &str, reason: &str) -> Result<JobState> {
        let job = self
            .state
            .job(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        match job.state {
            JobState::Compensating => return Ok(JobState::Compensating),
            state if state.is_terminal() => {
                return Err(SchedulerError::protocol(
                    job_id,
                    None,
                    format!("cannot cancel a {state} job"),
                ))
            }
            _ => {}
        }

        let outstanding = job.outstanding();
        self.commit(SagaRecord::job(
            job_id,
            Transition::JobCompensating {
                reason: format!("cancelled: {reason}"),
            },
        ))?;
        tracing::info!(job_id, reason, "Job cancelled");
        self.abort_outstanding(outstanding);
        self.finish_compensation(job_id)
    }

    pub fn handle_worker_event(&mut self, event: WorkerEvent) -> Result<EventOutcome> {
        self.handle_worker_event_at(event, Instant::now())
    }

    /// Apply a worker report. Reports are idempotent: repeats of an applied
    /// report and reports about assignments that no longer exist are
    /// no-ops, not errors. A report counts for the current assignment only
    /// if both the worker and the attempt number match.
    pub fn handle_worker_event_at(
        &mut self,
        event: WorkerEvent,
        now: Instant,
    ) -> Result<EventOutcome> {
        let key = event.task_key();
        let job = match self.state.job(&event.job_id) {
            Some(job) => job,
            None => self
                .archive
                .get(&event.job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(event.job_id.clone()))?,
        };
        let task = job
            .task(&event.task_id)
            .ok_or_else(|| SchedulerError::TaskNotFound {
                job_id: event.job_id.clone(),
                task_id: event.task_id.clone(),
            })?;
        let held = task.assigned_worker.as_deref() == Some(event.worker_id.as_str())
            && task.attempt == event.attempt;
        let (task_state, current_attempt) = (task.state, task.attempt);
        let job_state = job.state;

        if !held {
            tracing::warn!(
                task = %key,
                worker_id = %event.worker_id,
                attempt = event.attempt,
                current_attempt,
                state = %task_state,
                "Ignoring report for an assignment the task no longer has"
            );
            return Ok(EventOutcome::Stale);
        }

        if !job_state.is_active() {
            let outcome = match (&event.kind, task_state) {
                (WorkerEventKind::Succeeded, TaskState::Succeeded)
                | (WorkerEventKind::Failed { .. }, TaskState::Failed) => EventOutcome::Duplicate,
                _ => EventOutcome::Stale,
            };
            tracing::debug!(task = %key, job_state = %job_state, "Report for inactive job");
            return Ok(outcome);
        }

        let worker_id = event.worker_id;
        match (event.kind, task_state) {
            (WorkerEventKind::Started, TaskState::Assigned) => {
                self.commit(SagaRecord::task(
                    key.job_id.clone(),
                    key.task_id.clone(),
                    Transition::TaskRunning {
                        worker_id: worker_id.clone(),
                    },
                ))?;
                self.timers.insert(key.clone(), TaskTimer::at(now));
                tracing::info!(task = %key, worker_id = %worker_id, "Task running");
                Ok(EventOutcome::Applied)
            }
            (WorkerEventKind::Started, TaskState::Running) => {
                self.touch(&key, now);
                Ok(EventOutcome::Duplicate)
            }
            (WorkerEventKind::Heartbeat, TaskState::Assigned | TaskState::Running) => {
                self.touch(&key, now);
                Ok(EventOutcome::Acknowledged)
            }
            (WorkerEventKind::Succeeded, TaskState::Assigned | TaskState::Running) => {
                self.finish_task(
                    &key,
                    &worker_id,
                    Transition::TaskCompleted {
                        worker_id: worker_id.clone(),
                    },
                    now,
                )?;
                Ok(EventOutcome::Applied)
            }
            (
                WorkerEventKind::Failed { reason, retryable },
                TaskState::Assigned | TaskState::Running,
            ) => {
                self.finish_task(
                    &key,
                    &worker_id,
                    Transition::TaskFailed {
                        worker_id: Some(worker_id.clone()),
                        reason,
                        retryable,
                    },
                    now,
                )?;
                Ok(EventOutcome::Applied)
            }
            (WorkerEventKind::Succeeded | WorkerEventKind::Heartbeat, TaskState::Succeeded) => {
                Ok(EventOutcome::Duplicate)
            }
            (kind, state) => Err(SchedulerError::protocol(
                key.job_id.clone(),
                Some(&key.task_id),
                format!("worker {worker_id} reported {kind:?} for a {state} task"),
            )),
        }
    }

    fn touch(&mut self, key: &TaskKey, now: Instant) {
        self.timers
            .entry(key.clone())
            .and_modify(|t| t.last_progress = now)
            .or_insert_with(|| TaskTimer::at(now));
    }

    /// Push a membership signal into the cluster view. Returns false if it
    /// was stale.
    pub fn apply_membership(&mut self, event: MembershipEvent, now: Instant) -> bool {
        self.cluster.apply(event, now)
    }

    /// Log a task leaving its worker (completion or failure) and settle the
    /// consequences for the job.
    fn finish_task(
        &mut self,
        key: &TaskKey,
        worker_id: &str,
        transition: Transition,
        now: Instant,
    ) -> Result<()> {
        let siblings: Vec<(TaskKey, WorkerId)> = self
            .state
            .job(&key.job_id)
            .map(|j| j.outstanding())
            .unwrap_or_default()
            .into_iter()
            .filter(|(k, _)| k != key)
            .collect();

        self.commit(SagaRecord::task(
            key.job_id.clone(),
            key.task_id.clone(),
            transition,
        ))?;
        if !worker_id.is_empty() {
            self.cluster.release(worker_id, key);
        }
        self.settle(key, siblings, now)
    }

    fn settle(
        &mut self,
        key: &TaskKey,
        siblings: Vec<(TaskKey, WorkerId)>,
        now: Instant,
    ) -> Result<()> {
        let Some(job) = self.state.job(&key.job_id) else {
            return Ok(());
        };
        let job_state = job.state;
        let task = job.task(&key.task_id);
        let task_state = task.map(|t| t.state);
        let retry_count = task.map(|t| t.retry_count).unwrap_or(0);

        match job_state {
            JobState::Compensating => {
                tracing::warn!(
                    job_id = %key.job_id,
                    reason = job.failure.as_deref().unwrap_or(""),
                    "Job compensating"
                );
                self.abort_outstanding(siblings);
                self.finish_compensation(&key.job_id)?;
            }
            JobState::Completed => {
                self.clear_job_timers(&key.job_id);
                stats::record_job_finished(JobState::Completed);
                tracing::info!(job_id = %key.job_id, "Job completed");
            }
            _ if task_state == Some(TaskState::Runnable) => {
                self.timers.insert(key.clone(), TaskTimer::at(now));
                stats::record_task_retry();
                tracing::info!(task = %key, retry = retry_count, "Task failed, retrying");
            }
            _ => {
                self.timers.remove(key);
                tracing::info!(task = %key, state = ?task_state, "Task finished");
            }
        }
        Ok(())
    }

    /// Release workers and queue cancellation for tasks compensation aborted.
    fn abort_outstanding(&mut self, outstanding: Vec<(TaskKey, WorkerId)>) {
        for (task, worker_id) in outstanding {
            self.cluster.release(&worker_id, &task);
            self.timers.remove(&task);
            tracing::info!(task = %task, worker_id = %worker_id, "Cancelling task");
            self.commands.push(WorkerCommand::Cancel { task, worker_id });
        }
    }

    /// Run the compensator for a Compensating job and log the outcome.
    fn finish_compensation(&mut self, job_id: &str) -> Result<JobState> {
        let outcome = {
            let job = self
                .state
                .job(job_id)
                .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
            self.compensator.compensate(job)
        };
        let final_state = outcome.final_state();
        self.commit(SagaRecord::job(
            job_id,
            Transition::JobEnded { state: final_state },
        ))?;
        self.clear_job_timers(job_id);

        stats::record_job_finished(final_state);
        tracing::info!(job_id, state = %final_state, "Compensation finished");
        Ok(final_state)
    }

    fn clear_job_timers(&mut self, job_id: &str) {
        self.timers.retain(|key, _| key.job_id != job_id);
    }

    pub fn run_pass(&mut self) -> Result<PassReport> {
        self.run_pass_at(Instant::now())
    }

    /// One scheduling pass: re-queue orphans, fail tasks deferred past the
    /// job-level bound, place runnable tasks, and compact the log if due.
    pub fn run_pass_at(&mut self, now: Instant) -> Result<PassReport> {
        let started = Instant::now();
        let orphaned = self.requeue_orphans(now)?;
        self.expire_deferred(now)?;

        let requests: Vec<PlacementRequest> = self
            .state
            .runnable_tasks()
            .into_iter()
            .map(|(task, t)| PlacementRequest {
                task,
                resources: t.resources.clone(),
            })
            .collect();
        let workers = self.cluster.available_workers();
        let decisions = if requests.is_empty() || workers.is_empty() {
            Vec::new()
        } else {
            self.placement.assign(&requests, &workers)
        };

        let mut assigned = 0;
        for decision in decisions {
            let task = decision.task.clone();
            match self.assign(decision, now) {
                Ok(()) => assigned += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(task = %task, error = %e, "Assignment rejected"),
            }
        }

        let deferred = requests.len().saturating_sub(assigned);
        if deferred > 0 {
            tracing::debug!(deferred, "Tasks deferred, no worker fits");
        }
        stats::record_pass(deferred, self.queue_depth(), started.elapsed());

        let compacted = self.maybe_compact()?;
        Ok(PassReport {
            assigned,
            deferred,
            orphaned,
            compacted,
        })
    }

    /// Reserve capacity, log the decision, then queue the dispatch.
    fn assign(&mut self, decision: Assignment, now: Instant) -> Result<()> {
        let Assignment {
            task: key,
            worker_id,
        } = decision;
        let task = self
            .state
            .task(&key)
            .ok_or_else(|| SchedulerError::TaskNotFound {
                job_id: key.job_id.clone(),
                task_id: key.task_id.clone(),
            })?;
        let resources = task.resources.clone();
        let command = task.command.clone();
        let attempt = task.attempt + 1;
        let address = self
            .cluster
            .get(&worker_id)
            .map(|w| w.address.clone())
            .ok_or_else(|| SchedulerError::WorkerNotFound(worker_id.clone()))?;

        self.cluster
            .mark_busy(&worker_id, key.clone(), &resources)?;
        let committed = self.commit(SagaRecord::task(
            key.job_id.clone(),
            key.task_id.clone(),
            Transition::TaskAssigned {
                worker_id: worker_id.clone(),
                attempt,
            },
        ));
        if let Err(e) = committed {
            self.cluster.release(&worker_id, &key);
            return Err(e);
        }

        self.timers.insert(key.clone(), TaskTimer::at(now));
        stats::record_task_assigned();
        tracing::info!(task = %key, worker_id = %worker_id, attempt, "Task assigned");
        self.commands.push(WorkerCommand::Dispatch {
            task: key,
            worker_id,
            attempt,
            address,
            command,
            resources,
        });
        Ok(())
    }

    /// Re-queue tasks whose worker left, stayed unreachable past the grace
    /// period, never started, or went silent.
    fn requeue_orphans(&mut self, now: Instant) -> Result<usize> {
        let grace = self.config.orphan_grace();
        let dispatch_timeout = self.config.dispatch_timeout();
        let heartbeat_timeout = self.config.heartbeat_timeout();

        let mut orphans = Vec::new();
        for (key, task) in self.state.outstanding_tasks() {
            let Some(worker_id) = task.assigned_worker.as_deref() else {
                continue;
            };
            let timer = self
                .timers
                .get(&key)
                .copied()
                .unwrap_or_else(|| TaskTimer::at(now));

            let reason = match self.cluster.get(worker_id) {
                None => Some(format!("worker {worker_id} left the cluster")),
                Some(w) if w.health == WorkerHealth::Unreachable => self
                    .cluster
                    .grace_expired(worker_id, grace, now)
                    .then(|| format!("worker {worker_id} unreachable beyond {grace:?}")),
                Some(_)
                    if task.state == TaskState::Assigned
                        && now.saturating_duration_since(timer.since) >= dispatch_timeout =>
                {
                    Some(format!("not started within {dispatch_timeout:?}"))
                }
                Some(w)
                    if task.state == TaskState::Running
                        && now.saturating_duration_since(timer.last_progress.max(w.last_heartbeat))
                            >= heartbeat_timeout =>
                {
                    Some(format!("no heartbeat within {heartbeat_timeout:?}"))
                }
                _ => None,
            };

            if let Some(reason) = reason {
                orphans.push((key, worker_id.to_string(), reason));
            }
        }

        let count = orphans.len();
        for (key, worker_id, reason) in orphans {
            self.requeue(key, &worker_id, reason, now)?;
        }
        Ok(count)
    }

    fn requeue(&mut self, key: TaskKey, worker_id: &str, reason: String, now: Instant) -> Result<()> {
        self.commit(SagaRecord::task(
            key.job_id.clone(),
            key.task_id.clone(),
            Transition::TaskRequeued {
                reason: reason.clone(),
            },
        ))?;
        if self.cluster.contains(worker_id) {
            self.cluster.release(worker_id, &key);
            self.commands.push(WorkerCommand::Cancel {
                task: key.clone(),
                worker_id: worker_id.to_string(),
            });
        }
        stats::record_task_orphaned();
        tracing::warn!(task = %key, worker_id, reason = %reason, "Re-queued orphaned task");
        self.timers.insert(key, TaskTimer::at(now));
        Ok(())
    }

    /// Fail jobs whose tasks have waited for placement longer than allowed.
    fn expire_deferred(&mut self, now: Instant) -> Result<()> {
        let Some(max_age) = self.config.max_runnable_age() else {
            return Ok(());
        };
        let expired: Vec<TaskKey> = self
            .state
            .runnable_tasks()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| {
                self.timers
                    .get(key)
                    .is_some_and(|t| now.saturating_duration_since(t.since) >= max_age)
            })
            .collect();

        for key in expired {
            let still_active = self
                .state
                .job(&key.job_id)
                .is_some_and(|j| j.state.is_active());
            if !still_active {
                continue;
            }
            tracing::warn!(task = %key, max_age = ?max_age, "Task could not be placed in time");
            self.finish_task(
                &key,
                "",
                Transition::TaskFailed {
                    worker_id: None,
                    reason: format!("no worker could host the task within {max_age:?}"),
                    retryable: false,
                },
                now,
            )?;
        }
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<bool> {
        let len = self.log.len();
        if len < self.config.compaction_threshold {
            return Ok(false);
        }
        let live = self.state.jobs().filter(|j| !j.state.is_terminal()).count() as u64;
        if len <= live {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    /// Rewrite the log as one snapshot per live job and archive finished
    /// jobs. Returns the number of archived jobs.
    pub fn compact(&mut self) -> Result<usize> {
        let before = self.log.len();
        let finished: Vec<Job> = self
            .state
            .jobs()
            .filter(|j| j.state.is_terminal())
            .cloned()
            .collect();
        let archived = finished.len();
        let entries = self.state.snapshot_entries();

        self.log.compact(entries.clone())?;
        self.state = SchedulerState::replay(entries.into_iter().map(Ok))?;
        for job in finished {
            self.archive.insert(job);
        }

        stats::record_compaction();
        tracing::info!(
            entries_before = before,
            entries_after = self.log.len(),
            archived_jobs = archived,
            "Saga log compacted"
        );
        Ok(archived)
    }

    /// Reconcile replayed state with the cluster view before serving:
    /// restore reservations for running tasks whose worker is still around,
    /// re-queue the rest, and finish any compensation interrupted by the
    /// crash. A task that was assigned but never reported started may never
    /// have been dispatched, so it is re-queued and its worker told to drop
    /// it; the next attempt number makes any late report from it stale.
    pub(crate) fn reconcile(&mut self, now: Instant) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            jobs_recovered: self.state.job_count(),
            ..RecoveryReport::default()
        };

        let runnable: Vec<TaskKey> = self
            .state
            .runnable_tasks()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        for key in runnable {
            self.timers.insert(key, TaskTimer::at(now));
        }

        let outstanding: Vec<_> = self
            .state
            .outstanding_tasks()
            .into_iter()
            .filter_map(|(key, task)| {
                task.assigned_worker
                    .clone()
                    .map(|w| (key, w, task.state, task.resources.clone()))
            })
            .collect();
        for (key, worker_id, task_state, resources) in outstanding {
            let reason = match self.cluster.get(&worker_id) {
                None => Some(format!("worker {worker_id} unknown after restart")),
                Some(w) if w.health == WorkerHealth::Unreachable => {
                    Some(format!("worker {worker_id} unreachable after restart"))
                }
                Some(_) if task_state == TaskState::Assigned => {
                    Some("not started before restart".to_string())
                }
                Some(_) => None,
            };
            match reason {
                Some(reason) => {
                    self.requeue(key, &worker_id, reason, now)?;
                    report.tasks_requeued += 1;
                }
                None => {
                    self.cluster.restore(&worker_id, key.clone(), resources);
                    self.timers.insert(key, TaskTimer::at(now));
                }
            }
        }

        for job_id in self.state.jobs_in(JobState::Compensating) {
            tracing::warn!(job_id = %job_id, "Finishing interrupted compensation");
            self.finish_compensation(&job_id)?;
            report.jobs_compensated += 1;
        }

        Ok(report)
    }
}
