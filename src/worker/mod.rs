//! Simulated workers for the in-memory cluster.
//!
//! Stands in for the transport layer: consumes [`WorkerCommand`]s from the
//! scheduler and reports progress back through a [`SchedulerHandle`].
//!
//! - [`SimulatedExecutor`]: runs one task attempt with random latency
//! - [`heartbeat::HeartbeatSender`]: keeps the workers' liveness fresh

pub mod executor;
pub mod heartbeat;

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cluster::WorkerId;
use crate::node::SchedulerHandle;
use crate::scheduler::{TaskKey, WorkerCommand, WorkerEvent, WorkerEventKind};

pub use executor::SimulatedExecutor;
pub use heartbeat::HeartbeatSender;

/// Runs dispatched tasks as tokio tasks, one per (worker, task) attempt.
pub struct WorkerPool {
    executor: SimulatedExecutor,
    handle: SchedulerHandle,
    running: HashMap<(WorkerId, TaskKey), JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(executor: SimulatedExecutor, handle: SchedulerHandle) -> Self {
        Self {
            executor,
            handle,
            running: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut commands_rx: mpsc::Receiver<WorkerCommand>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands_rx.recv() => match command {
                    Some(command) => self.dispatch(command),
                    None => break,
                },
            }
        }

        for (_, attempt) in self.running.drain() {
            attempt.abort();
        }
    }

    fn dispatch(&mut self, command: WorkerCommand) {
        self.running.retain(|_, attempt| !attempt.is_finished());

        match command {
            WorkerCommand::Dispatch {
                task,
                worker_id,
                attempt,
                command,
                ..
            } => {
                let key = (worker_id.clone(), task.clone());
                let handle = self.handle.clone();
                let executor = self.executor.clone();
                let run = tokio::spawn(async move {
                    let started = WorkerEvent::new(worker_id.clone(), &task, attempt, WorkerEventKind::Started);
                    report(&handle, started).await;
                    let outcome = executor.execute(&task, &command).await;
                    report(&handle, WorkerEvent::new(worker_id, &task, attempt, outcome)).await;
                });
                if let Some(previous) = self.running.insert(key, run) {
                    previous.abort();
                }
            }
            WorkerCommand::Cancel { task, worker_id } => {
                if let Some(attempt) = self.running.remove(&(worker_id.clone(), task.clone())) {
                    attempt.abort();
                    tracing::info!(task = %task, worker_id = %worker_id, "Task attempt cancelled");
                }
            }
        }
    }
}

async fn report(handle: &SchedulerHandle, event: WorkerEvent) {
    let task = event.task_key();
    match handle.report(event).await {
        Ok(outcome) => tracing::debug!(task = %task, outcome = ?outcome, "Report delivered"),
        Err(e) => tracing::warn!(task = %task, error = %e, "Report rejected"),
    }
}
