use crate::cluster::view::{MembershipEvent, MembershipKind};
use crate::cluster::worker::{Resources, WorkerId};

/// Membership provider for a fixed, process-local set of identical workers.
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    workers: Vec<(WorkerId, String)>,
    capacity: Resources,
}

impl InMemoryCluster {
    pub fn new(count: usize, capacity: Resources) -> Self {
        let workers = (0..count)
            .map(|i| (format!("worker-{i}"), format!("inmemory://worker-{i}")))
            .collect();
        Self { workers, capacity }
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn capacity(&self) -> &Resources {
        &self.capacity
    }

    /// One `Joined` event per worker, generation 1.
    pub fn join_events(&self) -> Vec<MembershipEvent> {
        self.workers
            .iter()
            .map(|(id, address)| MembershipEvent {
                worker_id: id.clone(),
                generation: 1,
                kind: MembershipKind::Joined {
                    address: address.clone(),
                    capacity: self.capacity.clone(),
                },
            })
            .collect()
    }

    pub fn heartbeat_events(&self) -> Vec<MembershipEvent> {
        self.workers
            .iter()
            .map(|(id, _)| MembershipEvent {
                worker_id: id.clone(),
                generation: 1,
                kind: MembershipKind::Heartbeat,
            })
            .collect()
    }
}
