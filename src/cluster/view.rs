use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cluster::worker::{Resources, WorkerHealth, WorkerId, WorkerNode};
use crate::error::{Result, SchedulerError};
use crate::scheduler::job::TaskKey;

/// Signal from the membership provider about one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub worker_id: WorkerId,
    /// Per-worker version. Events older than the last applied one are dropped.
    pub generation: u64,
    pub kind: MembershipKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MembershipKind {
    Joined { address: String, capacity: Resources },
    Left,
    Healthy,
    Unreachable,
    Draining,
    Heartbeat,
}

/// Read-only copy of a worker taken for one placement pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub address: String,
    pub capacity: Resources,
    pub remaining: Resources,
}

/// The set of known workers and their health.
///
/// State changes are pushed in by the membership provider; the view never
/// calls out to workers. All transitions are idempotent.
#[derive(Debug, Default, Clone)]
pub struct ClusterView {
    workers: BTreeMap<WorkerId, WorkerNode>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerNode> {
        self.workers.get(worker_id)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerNode> {
        self.workers.values()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Add or replace a worker. Reservations survive a re-join.
    pub fn join(&mut self, node: WorkerNode) {
        match self.workers.get_mut(&node.id) {
            Some(existing) => {
                existing.address = node.address;
                existing.capacity = node.capacity;
                existing.generation = existing.generation.max(node.generation);
                existing.last_heartbeat = node.last_heartbeat;
                existing.refresh_health();
            }
            None => {
                tracing::info!(worker_id = %node.id, address = %node.address, "Worker joined");
                self.workers.insert(node.id.clone(), node);
            }
        }
    }

    /// Remove a worker. Returns the tasks it was holding.
    pub fn leave(&mut self, worker_id: &str) -> Vec<TaskKey> {
        match self.workers.remove(worker_id) {
            Some(node) => {
                tracing::info!(worker_id, "Worker left");
                node.tasks().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Workers currently `Available`, ordered by id.
    pub fn available_workers(&self) -> Vec<WorkerSnapshot> {
        self.workers
            .values()
            .filter(|w| w.health == WorkerHealth::Available)
            .map(|w| WorkerSnapshot {
                id: w.id.clone(),
                address: w.address.clone(),
                capacity: w.capacity.clone(),
                remaining: w.remaining(),
            })
            .collect()
    }

    /// Reserve capacity on `worker_id` for `task`. Fails if the worker is
    /// unknown, not `Available`, or lacks capacity.
    pub fn mark_busy(&mut self, worker_id: &str, task: TaskKey, need: &Resources) -> Result<()> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| SchedulerError::WorkerNotFound(worker_id.to_string()))?;
        if worker.holds(&task) {
            return Ok(());
        }
        let claim = need.claim_on(&worker.capacity);
        if worker.health != WorkerHealth::Available || !worker.remaining().fits(&claim) {
            return Err(SchedulerError::protocol(
                task.job_id.clone(),
                Some(&task.task_id),
                format!(
                    "worker {} cannot host task ({}, remaining {:?})",
                    worker_id,
                    worker.health,
                    worker.remaining()
                ),
            ));
        }
        worker.reserve(task, claim);
        Ok(())
    }

    /// Drop the reservation for `task`. Unknown workers and tasks are ignored.
    pub fn release(&mut self, worker_id: &str, task: &TaskKey) {
        if let Some(worker) = self.workers.get_mut(worker_id) {
            worker.release(task);
        }
    }

    /// Re-establish a reservation the worker held before a restart. Health
    /// and capacity are not checked; the task is already running there.
    pub fn restore(&mut self, worker_id: &str, task: TaskKey, need: Resources) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(worker) => {
                let claim = need.claim_on(&worker.capacity);
                worker.reserve(task, claim);
                true
            }
            None => false,
        }
    }

    /// Worker is reachable and accepting work again.
    pub fn mark_available(&mut self, worker_id: &str, now: Instant) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if worker.health == WorkerHealth::Unreachable {
            tracing::info!(worker_id, "Worker reachable again");
        }
        worker.health = WorkerHealth::Available;
        worker.unreachable_since = None;
        worker.last_heartbeat = now;
        worker.refresh_health();
        true
    }

    /// Start the orphan grace window. Repeated calls keep the original start.
    pub fn mark_unreachable(&mut self, worker_id: &str, now: Instant) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if worker.health != WorkerHealth::Unreachable {
            tracing::warn!(worker_id, tasks = worker.tasks().count(), "Worker unreachable");
            worker.health = WorkerHealth::Unreachable;
            worker.unreachable_since = Some(now);
        }
        true
    }

    /// Stop placing new work on the worker; in-flight tasks continue.
    pub fn mark_draining(&mut self, worker_id: &str) -> bool {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            return false;
        };
        if worker.health != WorkerHealth::Draining {
            tracing::info!(worker_id, "Worker draining");
            worker.health = WorkerHealth::Draining;
        }
        true
    }

    pub fn heartbeat(&mut self, worker_id: &str, now: Instant) -> bool {
        match self.workers.get_mut(worker_id) {
            Some(worker) => {
                worker.last_heartbeat = now;
                true
            }
            None => false,
        }
    }

    /// True once the worker has been unreachable for at least `grace`.
    pub fn grace_expired(&self, worker_id: &str, grace: Duration, now: Instant) -> bool {
        self.workers
            .get(worker_id)
            .and_then(|w| w.unreachable_since)
            .is_some_and(|since| now.saturating_duration_since(since) >= grace)
    }

    /// Apply a membership event with per-worker compare-and-set on
    /// `generation`. Returns false if the event was stale or ignored.
    pub fn apply(&mut self, event: MembershipEvent, now: Instant) -> bool {
        if let Some(existing) = self.workers.get(&event.worker_id) {
            if event.generation < existing.generation {
                tracing::debug!(
                    worker_id = %event.worker_id,
                    generation = event.generation,
                    current = existing.generation,
                    "Dropping stale membership event"
                );
                return false;
            }
        }

        let worker_id = event.worker_id;
        let applied = match event.kind {
            MembershipKind::Joined { address, capacity } => {
                let mut node = WorkerNode::new(worker_id.clone(), address, capacity);
                node.generation = event.generation;
                node.last_heartbeat = now;
                self.join(node);
                true
            }
            MembershipKind::Left => {
                self.leave(&worker_id);
                return true;
            }
            MembershipKind::Healthy => self.mark_available(&worker_id, now),
            MembershipKind::Unreachable => self.mark_unreachable(&worker_id, now),
            MembershipKind::Draining => self.mark_draining(&worker_id),
            MembershipKind::Heartbeat => self.heartbeat(&worker_id, now),
        };

        if let Some(worker) = self.workers.get_mut(&worker_id) {
            worker.generation = worker.generation.max(event.generation);
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(id: &str, generation: u64, cpu: u64) -> MembershipEvent {
        MembershipEvent {
            worker_id: id.to_string(),
            generation,
            kind: MembershipKind::Joined {
                address: format!("{id}:7000"),
                capacity: Resources::new(cpu, 1024),
            },
        }
    }

    fn signal(id: &str, generation: u64, kind: MembershipKind) -> MembershipEvent {
        MembershipEvent {
            worker_id: id.to_string(),
            generation,
            kind,
        }
    }

    #[test]
    fn available_workers_are_sorted_and_filtered() {
        let now = Instant::now();
        let mut view = ClusterView::new();
        view.apply(joined("w2", 1, 1000), now);
        view.apply(joined("w1", 1, 1000), now);
        view.apply(joined("w3", 1, 1000), now);
        view.mark_draining("w3");

        let ids: Vec<_> = view.available_workers().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["w1", "w2"]);
    }

    #[test]
    fn mark_busy_rejects_insufficient_capacity() {
        let now = Instant::now();
        let mut view = ClusterView::new();
        view.apply(joined("w1", 1, 500), now);

        let key = TaskKey::new("j", "t1");
        assert!(view
            .mark_busy("w1", key.clone(), &Resources::new(600, 10))
            .is_err());
        view.mark_busy("w1", key.clone(), &Resources::new(500, 10)).unwrap();
        // idempotent for the same task
        view.mark_busy("w1", key, &Resources::new(500, 10)).unwrap();
        assert_eq!(view.get("w1").unwrap().health, WorkerHealth::Busy);
        assert!(view.available_workers().is_empty());
    }

    #[test]
    fn mark_busy_on_unknown_worker_fails() {
        let mut view = ClusterView::new();
        let err = view
            .mark_busy("ghost", TaskKey::new("j", "t"), &Resources::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::WorkerNotFound(_)));
    }

    #[test]
    fn unreachable_keeps_first_timestamp() {
        let t0 = Instant::now();
        let mut view = ClusterView::new();
        view.apply(joined("w1", 1, 500), t0);

        assert!(view.mark_unreachable("w1", t0));
        assert!(view.mark_unreachable("w1", t0 + Duration::from_secs(5)));
        assert_eq!(view.get("w1").unwrap().unreachable_since, Some(t0));

        assert!(!view.grace_expired("w1", Duration::from_secs(10), t0 + Duration::from_secs(9)));
        assert!(view.grace_expired("w1", Duration::from_secs(10), t0 + Duration::from_secs(10)));

        view.mark_available("w1", t0 + Duration::from_secs(11));
        assert_eq!(view.get("w1").unwrap().health, WorkerHealth::Available);
        assert!(!view.grace_expired("w1", Duration::from_secs(10), t0 + Duration::from_secs(60)));
    }

    #[test]
    fn stale_generation_is_dropped() {
        let now = Instant::now();
        let mut view = ClusterView::new();
        view.apply(joined("w1", 1, 500), now);
        assert!(view.apply(signal("w1", 3, MembershipKind::Unreachable), now));

        // a delayed "healthy" from generation 2 must not resurrect the worker
        assert!(!view.apply(signal("w1", 2, MembershipKind::Healthy), now));
        assert_eq!(view.get("w1").unwrap().health, WorkerHealth::Unreachable);

        assert!(view.apply(signal("w1", 4, MembershipKind::Healthy), now));
        assert_eq!(view.get("w1").unwrap().health, WorkerHealth::Available);
    }

    #[test]
    fn undeclared_requirement_needs_an_idle_worker() {
        let now = Instant::now();
        let mut view = ClusterView::new();
        view.apply(joined("w1", 1, 1000), now);

        view.mark_busy("w1", TaskKey::new("j", "small"), &Resources::new(100, 10))
            .unwrap();
        assert!(view
            .mark_busy("w1", TaskKey::new("j", "whole"), &Resources::default())
            .is_err());

        view.release("w1", &TaskKey::new("j", "small"));
        view.mark_busy("w1", TaskKey::new("j", "whole"), &Resources::default())
            .unwrap();
        assert_eq!(view.get("w1").unwrap().health, WorkerHealth::Busy);
        assert!(view.available_workers().is_empty());
    }

    #[test]
    fn leave_returns_held_tasks() {
        let now = Instant::now();
        let mut view = ClusterView::new();
        view.apply(joined("w1", 1, 1000), now);
        let key = TaskKey::new("j", "t1");
        view.mark_busy("w1", key.clone(), &Resources::new(100, 10)).unwrap();

        assert_eq!(view.leave("w1"), vec![key]);
        assert!(!view.contains("w1"));
        assert!(view.leave("w1").is_empty());
    }

    #[test]
    fn rejoin_keeps_reservations() {
        let now = Instant::now();
        let mut view = ClusterView::new();
        view.apply(joined("w1", 1, 1000), now);
        let key = TaskKey::new("j", "t1");
        view.mark_busy("w1", key.clone(), &Resources::new(100, 10)).unwrap();

        view.apply(joined("w1", 2, 2000), now);
        let worker = view.get("w1").unwrap();
        assert!(worker.holds(&key));
        assert_eq!(worker.remaining().cpu_millis, 1900);
        assert_eq!(worker.generation, 2);
    }
}
