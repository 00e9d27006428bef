//! Scheduler behaviour: placement, worker reports, retries, orphan
//! re-queueing, compensation and compaction.


use std::sync::Arc;
use std::time::{Duration, Instant};

use saga_scheduler::cluster::{MembershipKind, Resources, WorkerHealth};
use saga_scheduler::config::SchedulerConfig;
use saga_scheduler::saga::{MemorySagaLog, SagaLog, Transition};
use saga_scheduler::scheduler::{
    CompensationOutcome, EventOutcome, Job, JobSpec, JobState, RecoveryCoordinator, SchedulerState,
    TaskKey, TaskSpec, TaskState, WorkerEvent, WorkerEventKind,
};
use saga_scheduler::stats;
use saga_scheduler::SchedulerError;
use test_harness::{
    cancels, capture_metrics, cluster, dispatches, failed, new_scheduler, on_attempt,
    scheduler_over, signal, started, succeeded, test_config,
};

fn task(id: &str, cpu: u64, mem: u64) -> TaskSpec {
    TaskSpec::new(id, format!("run {id}")).with_resources(Resources::new(cpu, mem))
}

fn replayed(log: &MemorySagaLog) -> SchedulerState {
    SchedulerState::replay(log.entries().into_iter().map(Ok)).unwrap()
}

#[test]
fn test_second_task_waits_for_capacity() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 1000, 512), task("t2", 1000, 512)]).with_id("job-a"))
        .unwrap();
    let t1 = TaskKey::new("job-a", "t1");
    let t2 = TaskKey::new("job-a", "t2");

    let report = s.run_pass().unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(dispatches(&s.take_commands()), vec![(t1.clone(), "w1".to_string())]);
    assert_eq!(s.job("job-a").unwrap().task("t2").unwrap().state, TaskState::Runnable);
    assert_eq!(s.cluster().get("w1").unwrap().health, WorkerHealth::Busy);

    assert_eq!(s.handle_worker_event(started("w1", &t1)).unwrap(), EventOutcome::Applied);
    assert_eq!(s.handle_worker_event(succeeded("w1", &t1)).unwrap(), EventOutcome::Applied);
    assert_eq!(s.cluster().get("w1").unwrap().health, WorkerHealth::Available);

    let report = s.run_pass().unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(dispatches(&s.take_commands()), vec![(t2.clone(), "w1".to_string())]);

    s.handle_worker_event(started("w1", &t2)).unwrap();
    s.handle_worker_event(succeeded("w1", &t2)).unwrap();
    let job = s.job("job-a").unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.finished_at.is_some());
}

#[test]
fn test_oldest_job_is_placed_first() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t", 1000, 100)]).with_id("zz-first")).unwrap();
    s.submit_job(JobSpec::new(vec![task("t", 1000, 100)]).with_id("aa-second")).unwrap();

    s.run_pass().unwrap();
    assert_eq!(
        dispatches(&s.take_commands()),
        vec![(TaskKey::new("zz-first", "t"), "w1".to_string())]
    );
}

#[test]
fn test_unreachable_worker_tasks_requeued_after_grace() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024), ("w2", 1000, 1024)]);
    let now = Instant::now();
    s.submit_job(JobSpec::new(vec![task("t1", 500, 256)]).with_id("job-b")).unwrap();
    let t1 = TaskKey::new("job-b", "t1");

    s.run_pass_at(now).unwrap();
    assert_eq!(dispatches(&s.take_commands()), vec![(t1.clone(), "w1".to_string())]);
    s.handle_worker_event_at(started("w1", &t1), now).unwrap();

    assert!(s.apply_membership(signal("w1", 2, MembershipKind::Unreachable), now));

    let report = s.run_pass_at(now + Duration::from_secs(10)).unwrap();
    assert_eq!(report.orphaned, 0);
    assert_eq!(s.state().task(&t1).unwrap().state, TaskState::Running);

    let report = s.run_pass_at(now + Duration::from_secs(31)).unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(report.assigned, 1);
    let commands = s.take_commands();
    assert_eq!(cancels(&commands), vec![(t1.clone(), "w1".to_string())]);
    assert_eq!(dispatches(&commands), vec![(t1.clone(), "w2".to_string())]);

    let task = s.state().task(&t1).unwrap();
    assert_eq!(task.state, TaskState::Assigned);
    assert_eq!(task.assigned_worker.as_deref(), Some("w2"));
    assert_eq!(task.orphan_count, 1);
    assert_eq!(task.retry_count, 0);

    // the old worker's late report is ignored
    assert_eq!(
        s.handle_worker_event_at(succeeded("w1", &t1), now).unwrap(),
        EventOutcome::Stale
    );
    assert_eq!(s.state().task(&t1).unwrap().state, TaskState::Assigned);
}

#[test]
fn test_unstarted_assignment_requeued_after_dispatch_timeout() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    let now = Instant::now();
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("job")).unwrap();
    let t1 = TaskKey::new("job", "t1");

    s.run_pass_at(now).unwrap();
    s.take_commands();

    let report = s.run_pass_at(now + Duration::from_secs(5)).unwrap();
    assert_eq!(report.orphaned, 0);

    let report = s.run_pass_at(now + Duration::from_secs(11)).unwrap();
    assert_eq!(report.orphaned, 1);
    let commands = s.take_commands();
    assert_eq!(cancels(&commands).len(), 1);
    assert_eq!(dispatches(&commands), vec![(t1.clone(), "w1".to_string())]);
}

#[test]
fn test_departed_worker_tasks_requeued() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024), ("w2", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("job")).unwrap();
    let t1 = TaskKey::new("job", "t1");
    s.run_pass().unwrap();
    s.handle_worker_event(started("w1", &t1)).unwrap();

    s.apply_membership(signal("w1", 2, MembershipKind::Left), Instant::now());
    let report = s.run_pass().unwrap();
    assert_eq!(report.orphaned, 1);
    assert_eq!(
        s.state().task(&t1).unwrap().assigned_worker.as_deref(),
        Some("w2")
    );
}

#[test]
fn test_stale_membership_generation_dropped() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    assert!(!s.apply_membership(signal("w1", 0, MembershipKind::Unreachable), Instant::now()));
    assert_eq!(s.cluster().get("w1").unwrap().health, WorkerHealth::Available);
}

#[test]
fn test_retry_budget_exhaustion_fails_job() {
    let log = Arc::new(MemorySagaLog::new());
    let t1 = TaskKey::new("job-c", "t1");
    let t2 = TaskKey::new("job-c", "t2");

    let (s, metrics) = capture_metrics(|| {
        let mut s = scheduler_over(log.clone(), cluster(&[("w1", 1000, 1024)]), test_config());
        s.submit_job(
            JobSpec::new(vec![task("t1", 100, 100), task("t2", 100, 100)]).with_id("job-c"),
        )
        .unwrap();

        s.run_pass().unwrap();
        s.handle_worker_event(started("w1", &t2)).unwrap();
        s.handle_worker_event(succeeded("w1", &t2)).unwrap();

        for attempt in 1..=3 {
            if attempt > 1 {
                assert_eq!(s.run_pass().unwrap().assigned, 1);
            }
            assert_eq!(
                s.handle_worker_event(on_attempt(failed("w1", &t1), attempt)).unwrap(),
                EventOutcome::Applied
            );
        }
        s
    });

    let job = s.job("job-c").unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure.as_deref().unwrap().contains("failed after 2 retries"));
    assert_eq!(job.task("t1").unwrap().retry_count, 2);
    assert_eq!(job.task("t1").unwrap().state, TaskState::Failed);
    // partial success is kept, not rolled back
    assert_eq!(job.task("t2").unwrap().state, TaskState::Succeeded);

    let last = log.entries().pop().unwrap();
    assert_eq!(
        last.transition,
        Transition::JobEnded {
            state: JobState::Failed
        }
    );
    assert_eq!(metrics.counter(stats::TASK_RETRIES), 2);
    assert_eq!(metrics.counter(stats::JOBS_FAILED), 1);
    assert_eq!(metrics.counter(stats::JOBS_SUBMITTED), 1);
}

#[test]
fn test_redelivered_failure_after_retry_is_stale() {
    let (mut s, log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("job")).unwrap();
    let t1 = TaskKey::new("job", "t1");
    s.run_pass().unwrap();
    s.handle_worker_event(started("w1", &t1)).unwrap();

    let report = failed("w1", &t1);
    assert_eq!(s.handle_worker_event(report.clone()).unwrap(), EventOutcome::Applied);
    assert_eq!(s.run_pass().unwrap().assigned, 1);
    let task = s.state().task(&t1).unwrap();
    assert_eq!(task.assigned_worker.as_deref(), Some("w1"));
    assert_eq!(task.attempt, 2);

    // same worker, same task, but for the attempt that already failed
    let entries = log.len();
    assert_eq!(s.handle_worker_event(report).unwrap(), EventOutcome::Stale);
    let task = s.state().task(&t1).unwrap();
    assert_eq!(task.retry_count, 1);
    assert_eq!(task.state, TaskState::Assigned);
    assert_eq!(log.len(), entries);

    assert_eq!(
        s.handle_worker_event(on_attempt(started("w1", &t1), 2)).unwrap(),
        EventOutcome::Applied
    );
}

#[test]
fn test_compensation_cancels_outstanding_tasks() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024), ("w2", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 800, 100), task("t2", 800, 100)]).with_id("job"))
        .unwrap();
    let t1 = TaskKey::new("job", "t1");
    let t2 = TaskKey::new("job", "t2");
    s.run_pass().unwrap();
    s.take_commands();

    let fatal = WorkerEvent::new(
        "w1",
        &t1,
        1,
        WorkerEventKind::Failed {
            reason: "bad input".to_string(),
            retryable: false,
        },
    );
    s.handle_worker_event(fatal).unwrap();

    assert_eq!(s.job("job").unwrap().state, JobState::Failed);
    assert_eq!(cancels(&s.take_commands()), vec![(t2.clone(), "w2".to_string())]);
    let aborted = s.state().task(&t2).unwrap();
    assert_eq!(aborted.state, TaskState::Failed);
    assert_eq!(aborted.last_error.as_deref(), Some("aborted by compensation"));
    assert!(s.cluster().get("w2").unwrap().tasks().next().is_none());

    assert_eq!(
        s.handle_worker_event(succeeded("w2", &t2)).unwrap(),
        EventOutcome::Stale
    );
}

#[test]
fn test_custom_compensator_can_restore_job() {
    let log = Arc::new(MemorySagaLog::new());
    let (mut s, _) = RecoveryCoordinator::new(test_config(), log)
        .with_cluster(cluster(&[("w1", 1000, 1024)]))
        .with_compensator(|job: &Job| {
            assert_eq!(job.state, JobState::Compensating);
            CompensationOutcome::Restored
        })
        .recover()
        .unwrap();

    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("job")).unwrap();
    assert_eq!(s.cancel_job("job", "operator request").unwrap(), JobState::Completed);
    assert_eq!(s.job("job").unwrap().state, JobState::Completed);
}

#[test]
fn test_duplicate_reports_are_idempotent() {
    let (mut s, log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100), task("t2", 100, 100)]).with_id("job"))
        .unwrap();
    let t1 = TaskKey::new("job", "t1");
    s.run_pass().unwrap();

    assert_eq!(s.handle_worker_event(started("w1", &t1)).unwrap(), EventOutcome::Applied);
    assert_eq!(s.handle_worker_event(started("w1", &t1)).unwrap(), EventOutcome::Duplicate);
    assert_eq!(
        s.handle_worker_event(WorkerEvent::new("w1", &t1, 1, WorkerEventKind::Heartbeat))
            .unwrap(),
        EventOutcome::Acknowledged
    );
    assert_eq!(s.handle_worker_event(succeeded("w1", &t1)).unwrap(), EventOutcome::Applied);

    let before = s.state().clone();
    let entries = log.len();
    assert_eq!(s.handle_worker_event(succeeded("w1", &t1)).unwrap(), EventOutcome::Duplicate);
    assert_eq!(s.state(), &before);
    assert_eq!(log.len(), entries);
}

#[test]
fn test_conflicting_report_is_protocol_error() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100), task("t2", 100, 100)]).with_id("job"))
        .unwrap();
    let t1 = TaskKey::new("job", "t1");
    s.run_pass().unwrap();
    s.handle_worker_event(succeeded("w1", &t1)).unwrap();

    let err = s.handle_worker_event(started("w1", &t1)).unwrap_err();
    assert!(matches!(err, SchedulerError::Protocol { .. }));
    assert!(!err.is_fatal());
    assert_eq!(s.state().task(&t1).unwrap().state, TaskState::Succeeded);
}

#[test]
fn test_reports_for_unknown_jobs_and_tasks() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("job")).unwrap();

    assert!(matches!(
        s.handle_worker_event(started("w1", &TaskKey::new("nope", "t1"))),
        Err(SchedulerError::JobNotFound(_))
    ));
    assert!(matches!(
        s.handle_worker_event(started("w1", &TaskKey::new("job", "nope"))),
        Err(SchedulerError::TaskNotFound { .. })
    ));
    // Runnable task held by nobody
    assert_eq!(
        s.handle_worker_event(started("w1", &TaskKey::new("job", "t1"))).unwrap(),
        EventOutcome::Stale
    );
}

#[test]
fn test_submit_rejects_invalid_and_duplicate_jobs() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    assert!(matches!(
        s.submit_job(JobSpec::new(vec![])),
        Err(SchedulerError::InvalidJob(_))
    ));
    assert!(matches!(
        s.submit_job(JobSpec::new(vec![task("t", 1, 1), task("t", 1, 1)])),
        Err(SchedulerError::InvalidJob(_))
    ));

    s.submit_job(JobSpec::new(vec![task("t", 1, 1)]).with_id("job")).unwrap();
    assert!(matches!(
        s.submit_job(JobSpec::new(vec![task("t", 1, 1)]).with_id("job")),
        Err(SchedulerError::DuplicateJob(_))
    ));

    let generated = s.submit_job(JobSpec::new(vec![task("t", 1, 1)])).unwrap();
    assert!(uuid::Uuid::parse_str(&generated).is_ok());
    assert_eq!(s.state().job_count(), 2);
}

#[test]
fn test_cancel_job() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100), task("t2", 100, 100)]).with_id("job"))
        .unwrap();
    s.run_pass().unwrap();
    s.take_commands();

    assert_eq!(s.cancel_job("job", "no longer needed").unwrap(), JobState::Failed);
    assert_eq!(cancels(&s.take_commands()).len(), 2);
    let job = s.job("job").unwrap();
    assert!(job.failure.as_deref().unwrap().contains("no longer needed"));
    assert_eq!(s.cluster().get("w1").unwrap().remaining(), Resources::new(1000, 1024));

    assert!(matches!(
        s.cancel_job("job", "again"),
        Err(SchedulerError::Protocol { .. })
    ));
    assert!(matches!(
        s.cancel_job("missing", "x"),
        Err(SchedulerError::JobNotFound(_))
    ));
}

#[test]
fn test_unplaceable_task_fails_job_after_max_age() {
    let log = Arc::new(MemorySagaLog::new());
    let config = SchedulerConfig {
        max_runnable_age_ms: Some(1_000),
        ..test_config()
    };
    let mut s = scheduler_over(log, cluster(&[("w1", 1000, 1024)]), config);
    let now = Instant::now();
    s.submit_job(JobSpec::new(vec![task("huge", 64_000, 100)]).with_id("job")).unwrap();

    let report = s.run_pass_at(now).unwrap();
    assert_eq!(report.deferred, 1);
    assert_eq!(s.job("job").unwrap().state, JobState::Pending);

    s.run_pass_at(now + Duration::from_secs(2)).unwrap();
    let job = s.job("job").unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert!(job.failure.as_deref().unwrap().contains("no worker could host"));
}

#[test]
fn test_placement_never_exceeds_capacity() {
    let workers = [("w1", 2000, 2048), ("w2", 1500, 1024), ("w3", 1000, 4096)];
    let (mut s, _log) = new_scheduler(&workers);
    for j in 0..5 {
        let tasks = (0..4)
            .map(|t| task(&format!("t{t}"), 250 + 100 * t, 300))
            .collect();
        s.submit_job(JobSpec::new(tasks).with_id(format!("job-{j}"))).unwrap();
    }

    let report = s.run_pass().unwrap();
    assert!(report.assigned > 0);
    assert_eq!(report.assigned + report.deferred, 20);

    for (id, cpu, mem) in workers {
        let (used_cpu, used_mem) = s
            .state()
            .outstanding_tasks()
            .into_iter()
            .filter(|(_, t)| t.assigned_worker.as_deref() == Some(id))
            .fold((0, 0), |(c, m), (_, t)| {
                (c + t.resources.cpu_millis, m + t.resources.memory_mb)
            });
        assert!(used_cpu <= cpu, "{id} over cpu: {used_cpu}");
        assert!(used_mem <= mem, "{id} over memory: {used_mem}");
    }
}

#[test]
fn test_compaction_archives_finished_jobs() {
    let (mut s, log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("done")).unwrap();
    s.run_pass().unwrap();
    let done = TaskKey::new("done", "t1");
    s.handle_worker_event(started("w1", &done)).unwrap();
    s.handle_worker_event(succeeded("w1", &done)).unwrap();

    s.submit_job(JobSpec::new(vec![task("t1", 100, 100), task("t2", 100, 100)]).with_id("live"))
        .unwrap();
    s.run_pass().unwrap();
    s.handle_worker_event(started("w1", &TaskKey::new("live", "t1"))).unwrap();

    let before = s.job("live").unwrap().clone();
    assert_eq!(s.compact().unwrap(), 1);
    assert_eq!(log.len(), 1);
    assert!(s.job("done").is_none());
    assert_eq!(s.job("live").unwrap(), &before);
    assert_eq!(&replayed(&log), s.state());

    // new work after compaction keeps ordering and replays cleanly
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("later")).unwrap();
    assert!(s.job("later").unwrap().submitted_seq > before.submitted_seq);
    s.handle_worker_event(succeeded("w1", &TaskKey::new("live", "t1"))).unwrap();
    assert_eq!(&replayed(&log), s.state());
}

#[test]
fn test_reports_for_archived_jobs_are_duplicates() {
    let (mut s, log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("done")).unwrap();
    s.run_pass().unwrap();
    let done = TaskKey::new("done", "t1");
    s.handle_worker_event(started("w1", &done)).unwrap();
    s.handle_worker_event(succeeded("w1", &done)).unwrap();

    assert_eq!(s.compact().unwrap(), 1);
    assert!(s.job("done").is_none());

    let entries = log.len();
    assert_eq!(s.handle_worker_event(succeeded("w1", &done)).unwrap(), EventOutcome::Duplicate);
    assert_eq!(s.handle_worker_event(started("w1", &done)).unwrap(), EventOutcome::Stale);
    assert_eq!(log.len(), entries);
    assert!(s.job("done").is_none());

    assert!(matches!(
        s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("done")),
        Err(SchedulerError::DuplicateJob(_))
    ));
}

#[test]
fn test_pass_compacts_past_threshold() {
    let log = Arc::new(MemorySagaLog::new());
    let config = SchedulerConfig {
        compaction_threshold: 4,
        ..test_config()
    };
    let mut s = scheduler_over(log.clone(), cluster(&[("w1", 1000, 1024)]), config);
    s.submit_job(JobSpec::new(vec![task("t1", 100, 100)]).with_id("job")).unwrap();
    assert!(!s.run_pass().unwrap().compacted);

    let t1 = TaskKey::new("job", "t1");
    s.handle_worker_event(started("w1", &t1)).unwrap();
    s.handle_worker_event(succeeded("w1", &t1)).unwrap();
    assert_eq!(log.len(), 4);

    assert!(s.run_pass().unwrap().compacted);
    assert!(log.is_empty());
    assert_eq!(s.state().job_count(), 0);
}

#[test]
fn test_queue_depth_reported() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![task("a", 1000, 100), task("b", 1000, 100), task("c", 1000, 100)]))
        .unwrap();

    let (_, metrics) = capture_metrics(|| s.run_pass().unwrap());
    assert_eq!(metrics.gauge(stats::QUEUE_DEPTH), Some(2.0));
    assert_eq!(metrics.counter(stats::TASKS_ASSIGNED), 1);
    assert_eq!(metrics.counter(stats::PLACEMENT_DEFERRALS), 2);
    assert_eq!(metrics.samples(stats::ASSIGNMENT_LATENCY), 1);
}

#[test]
fn test_tasks_without_requirements_run_one_per_worker() {
    let (mut s, _log) = new_scheduler(&[("w1", 1000, 1024)]);
    s.submit_job(JobSpec::new(vec![TaskSpec::new("t1", "a"), TaskSpec::new("t2", "b")]).with_id("job"))
        .unwrap();
    let t1 = TaskKey::new("job", "t1");
    let t2 = TaskKey::new("job", "t2");

    let report = s.run_pass().unwrap();
    assert_eq!(report.assigned, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(dispatches(&s.take_commands()), vec![(t1.clone(), "w1".to_string())]);
    assert_eq!(s.state().task(&t2).unwrap().state, TaskState::Runnable);

    s.handle_worker_event(started("w1", &t1)).unwrap();
    s.handle_worker_event(succeeded("w1", &t1)).unwrap();
    assert_eq!(s.run_pass().unwrap().assigned, 1);
    assert_eq!(dispatches(&s.take_commands()), vec![(t2, "w1".to_string())]);
}
