use std::sync::Arc;
use std::time::Instant;

use crate::cluster::ClusterView;
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::saga::SagaLog;
use crate::scheduler::assigner::{BestFit, PlacementAlgorithm};
use crate::scheduler::compensation::{AbortCompensator, Compensator};
use crate::scheduler::engine::{RecoveryReport, Scheduler};
use crate::scheduler::state::SchedulerState;
use crate::stats;

/// Builds a [`Scheduler`] from the saga log at startup.
///
/// Replays every entry through the same transition function used live,
/// then reconciles in-flight tasks with the current cluster view. Any log
/// error aborts startup; the scheduler must not serve from a partial state.
pub struct RecoveryCoordinator {
    config: SchedulerConfig,
    log: Arc<dyn SagaLog>,
    cluster: ClusterView,
    placement: Box<dyn PlacementAlgorithm>,
    compensator: Box<dyn Compensator>,
}

impl RecoveryCoordinator {
    pub fn new(config: SchedulerConfig, log: Arc<dyn SagaLog>) -> Self {
        Self {
            config,
            log,
            cluster: ClusterView::new(),
            placement: Box::new(BestFit::new()),
            compensator: Box::new(AbortCompensator),
        }
    }

    pub fn with_cluster(mut self, cluster: ClusterView) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_placement(mut self, placement: impl PlacementAlgorithm + 'static) -> Self {
        self.placement = Box::new(placement);
        self
    }

    pub fn with_compensator(mut self, compensator: impl Compensator + 'static) -> Self {
        self.compensator = Box::new(compensator);
        self
    }

    pub fn recover(self) -> Result<(Scheduler, RecoveryReport)> {
        let started = Instant::now();
        self.config.validate()?;

        let mut state = SchedulerState::new();
        let mut replayed = 0u64;
        for entry in self.log.replay()? {
            let entry = entry.inspect_err(|e| {
                tracing::error!(after = replayed, error = %e, "Saga log unreadable during recovery");
            })?;
            state.apply(&entry).inspect_err(|e| {
                tracing::error!(seq = entry.seq, error = %e, "Saga log replay rejected an entry");
            })?;
            replayed += 1;
        }
        tracing::info!(entries = replayed, jobs = state.job_count(), "Saga log replayed");

        let mut scheduler = Scheduler::new(
            self.config,
            state,
            self.cluster,
            self.log,
            self.placement,
            self.compensator,
        );
        let mut report = scheduler.reconcile(Instant::now())?;
        report.entries_replayed = replayed;
        report.duration = started.elapsed();

        stats::record_recovery(report.duration);
        tracing::info!(
            jobs = report.jobs_recovered,
            requeued = report.tasks_requeued,
            compensated = report.jobs_compensated,
            elapsed_ms = report.duration.as_millis() as u64,
            "Recovery complete"
        );
        Ok((scheduler, report))
    }
}
