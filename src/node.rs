use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::cluster::MembershipEvent;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{
    EventOutcome, Job, JobId, JobSpec, JobState, Scheduler, WorkerCommand, WorkerEvent,
};

const MESSAGE_BUFFER: usize = 1024;

/// Requests to the scheduler loop. Each carries its own responder.
#[derive(Debug)]
pub enum SchedulerMessage {
    SubmitJob {
        spec: JobSpec,
        response_tx: oneshot::Sender<Result<JobId>>,
    },
    CancelJob {
        job_id: JobId,
        reason: String,
        response_tx: oneshot::Sender<Result<JobState>>,
    },
    WorkerEvent {
        event: WorkerEvent,
        response_tx: oneshot::Sender<Result<EventOutcome>>,
    },
    Membership {
        event: MembershipEvent,
    },
    GetJob {
        job_id: JobId,
        response_tx: oneshot::Sender<Option<Job>>,
    },
    ListJobs {
        response_tx: oneshot::Sender<Vec<Job>>,
    },
}

/// Cloneable front door to a running [`SchedulerNode`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerMessage>,
}

impl SchedulerHandle {
    pub async fn submit_job(&self, spec: JobSpec) -> Result<JobId> {
        self.request(|response_tx| SchedulerMessage::SubmitJob { spec, response_tx })
            .await?
    }

    pub async fn cancel_job(&self, job_id: impl Into<JobId>, reason: impl Into<String>) -> Result<JobState> {
        let (job_id, reason) = (job_id.into(), reason.into());
        self.request(|response_tx| SchedulerMessage::CancelJob {
            job_id,
            reason,
            response_tx,
        })
        .await?
    }

    pub async fn report(&self, event: WorkerEvent) -> Result<EventOutcome> {
        self.request(|response_tx| SchedulerMessage::WorkerEvent { event, response_tx })
            .await?
    }

    pub async fn membership(&self, event: MembershipEvent) -> Result<()> {
        self.tx
            .send(SchedulerMessage::Membership { event })
            .await
            .map_err(|_| SchedulerError::Unavailable("scheduler loop stopped".to_string()))
    }

    pub async fn job(&self, job_id: impl Into<JobId>) -> Result<Option<Job>> {
        let job_id = job_id.into();
        self.request(|response_tx| SchedulerMessage::GetJob { job_id, response_tx })
            .await
    }

    pub async fn jobs(&self) -> Result<Vec<Job>> {
        self.request(|response_tx| SchedulerMessage::ListJobs { response_tx })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerMessage,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(build(response_tx))
            .await
            .map_err(|_| SchedulerError::Unavailable("scheduler loop stopped".to_string()))?;
        response_rx
            .await
            .map_err(|_| SchedulerError::Unavailable("scheduler dropped the request".to_string()))
    }
}

/// Runs a [`Scheduler`] on a single task: requests arrive over a channel,
/// scheduling passes run on an interval and after each request, and worker
/// commands are forwarded to the transport channel.
pub struct SchedulerNode {
    scheduler: Scheduler,
    rx: mpsc::Receiver<SchedulerMessage>,
    commands_tx: mpsc::Sender<WorkerCommand>,
    interval: Duration,
}

impl SchedulerNode {
    pub fn new(scheduler: Scheduler, commands_tx: mpsc::Sender<WorkerCommand>) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(MESSAGE_BUFFER);
        let interval = scheduler.config().scheduling_interval();
        let node = Self {
            scheduler,
            rx,
            commands_tx,
            interval,
        };
        (node, SchedulerHandle { tx })
    }

    /// Serve until shutdown or a fatal error. A durability failure stops the
    /// loop; the process must recover from the log before serving again.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<Scheduler> {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            jobs = self.scheduler.state().job_count(),
            workers = self.scheduler.cluster().len(),
            "Scheduler loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Scheduler loop shutting down");
                    break;
                }
                msg = self.rx.recv() => {
                    let Some(msg) = msg else {
                        tracing::info!("All scheduler handles dropped");
                        break;
                    };
                    if let Err(e) = self.handle(msg).and_then(|_| self.pass()) {
                        tracing::error!(error = %e, "Scheduler stopped on fatal error");
                        return Err(e);
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.pass() {
                        tracing::error!(error = %e, "Scheduler stopped on fatal error");
                        return Err(e);
                    }
                }
            }
            self.flush().await;
        }

        self.flush().await;
        Ok(self.scheduler)
    }

    fn handle(&mut self, msg: SchedulerMessage) -> Result<()> {
        match msg {
            SchedulerMessage::SubmitJob { spec, response_tx } => {
                respond(response_tx, self.scheduler.submit_job(spec))
            }
            SchedulerMessage::CancelJob {
                job_id,
                reason,
                response_tx,
            } => respond(response_tx, self.scheduler.cancel_job(&job_id, &reason)),
            SchedulerMessage::WorkerEvent { event, response_tx } => {
                respond(response_tx, self.scheduler.handle_worker_event(event))
            }
            SchedulerMessage::Membership { event } => {
                self.scheduler.apply_membership(event, Instant::now());
                Ok(())
            }
            SchedulerMessage::GetJob {
                job_id,
                response_tx,
            } => {
                let _ = response_tx.send(self.scheduler.job(&job_id).cloned());
                Ok(())
            }
            SchedulerMessage::ListJobs { response_tx } => {
                let _ = response_tx.send(self.scheduler.state().jobs().cloned().collect());
                Ok(())
            }
        }
    }

    fn pass(&mut self) -> Result<()> {
        let report = self.scheduler.run_pass()?;
        if report.assigned > 0 || report.orphaned > 0 {
            tracing::debug!(
                assigned = report.assigned,
                deferred = report.deferred,
                orphaned = report.orphaned,
                "Scheduling pass"
            );
        }
        Ok(())
    }

    async fn flush(&mut self) {
        for command in self.scheduler.take_commands() {
            let task = command.task().clone();
            if self.commands_tx.send(command).await.is_err() {
                tracing::warn!(task = %task, "Worker command channel closed, dropping command");
            }
        }
    }
}

/// Hand the result to the caller. Fatal errors are also returned so the
/// loop stops.
fn respond<T>(response_tx: oneshot::Sender<Result<T>>, result: Result<T>) -> Result<()> {
    match result {
        Err(e) if e.is_fatal() => {
            let _ = response_tx.send(Err(SchedulerError::Unavailable(e.to_string())));
            Err(e)
        }
        other => {
            let _ = response_tx.send(other);
            Ok(())
        }
    }
}
