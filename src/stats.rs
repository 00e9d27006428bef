//! Scheduler metrics.
//!
//! Recorded through the `metrics` facade. Installing a recorder and
//! exporting is up to the host process; with none installed every call is
//! a no-op.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use crate::scheduler::JobState;

// ============================================================================
// Placement
// ============================================================================

/// Runnable tasks left after a scheduling pass.
pub const QUEUE_DEPTH: &str = "saga_scheduler_queue_depth";

/// Scheduling pass duration histogram.
pub const ASSIGNMENT_LATENCY: &str = "saga_scheduler_assignment_latency_seconds";

pub const TASKS_ASSIGNED: &str = "saga_scheduler_tasks_assigned_total";

/// Runnable tasks a pass could not place.
pub const PLACEMENT_DEFERRALS: &str = "saga_scheduler_placement_deferrals_total";

// ============================================================================
// Task and job lifecycle
// ============================================================================

pub const TASK_RETRIES: &str = "saga_scheduler_task_retries_total";

/// Tasks taken back from a dead, silent or unstarted assignment.
pub const TASKS_ORPHANED: &str = "saga_scheduler_tasks_orphaned_total";

pub const JOBS_SUBMITTED: &str = "saga_scheduler_jobs_submitted_total";
pub const JOBS_COMPLETED: &str = "saga_scheduler_jobs_completed_total";

/// Jobs that ended failed or cancelled.
pub const JOBS_FAILED: &str = "saga_scheduler_jobs_failed_total";

// ============================================================================
// Log and recovery
// ============================================================================

pub const RECOVERY_DURATION: &str = "saga_scheduler_recovery_duration_seconds";
pub const LOG_COMPACTIONS: &str = "saga_scheduler_log_compactions_total";

/// Registers all scheduler metric descriptions.
///
/// Call this once at startup after installing the metrics recorder.
pub fn register_metrics() {
    describe_gauge!(QUEUE_DEPTH, "Runnable tasks waiting for a worker");
    describe_histogram!(ASSIGNMENT_LATENCY, "Duration of scheduling passes in seconds");
    describe_counter!(TASKS_ASSIGNED, "Total task assignments");
    describe_counter!(PLACEMENT_DEFERRALS, "Total runnable tasks left unplaced by a pass");
    describe_counter!(TASK_RETRIES, "Total task retries after failure");
    describe_counter!(TASKS_ORPHANED, "Total tasks taken back from their worker");
    describe_counter!(JOBS_SUBMITTED, "Total jobs accepted");
    describe_counter!(JOBS_COMPLETED, "Total jobs completed");
    describe_counter!(JOBS_FAILED, "Total jobs failed or cancelled");
    describe_histogram!(RECOVERY_DURATION, "Duration of startup recovery in seconds");
    describe_counter!(LOG_COMPACTIONS, "Total saga log compactions");
}

/// Records the outcome of one scheduling pass.
pub fn record_pass(deferred: usize, queue_depth: usize, elapsed: Duration) {
    if deferred > 0 {
        counter!(PLACEMENT_DEFERRALS).increment(deferred as u64);
    }
    gauge!(QUEUE_DEPTH).set(queue_depth as f64);
    histogram!(ASSIGNMENT_LATENCY).record(elapsed.as_secs_f64());
}

pub fn record_task_assigned() {
    counter!(TASKS_ASSIGNED).increment(1);
}

pub fn record_task_retry() {
    counter!(TASK_RETRIES).increment(1);
}

pub fn record_task_orphaned() {
    counter!(TASKS_ORPHANED).increment(1);
}

pub fn record_job_submitted() {
    counter!(JOBS_SUBMITTED).increment(1);
}

/// Records a job reaching a terminal state.
pub fn record_job_finished(state: JobState) {
    match state {
        JobState::Completed => counter!(JOBS_COMPLETED).increment(1),
        _ => counter!(JOBS_FAILED).increment(1),
    }
}

pub fn record_recovery(elapsed: Duration) {
    histogram!(RECOVERY_DURATION).record(elapsed.as_secs_f64());
}

pub fn record_compaction() {
    counter!(LOG_COMPACTIONS).increment(1);
}
