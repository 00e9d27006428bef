use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::scheduler::job::TaskKey;

pub type WorkerId = String;

/// Resource descriptor used both for a task's requirement and a worker's
/// capacity. Tags are matched as a subset and never deplete.
///
/// A requirement with neither CPU nor memory declared claims the whole
/// worker, so such tasks run one per node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub cpu_millis: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Resources {
    pub fn new(cpu_millis: u64, memory_mb: u64) -> Self {
        Self {
            cpu_millis,
            memory_mb,
            tags: BTreeSet::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// True if `self`, treated as remaining capacity, can host `need`.
    pub fn fits(&self, need: &Resources) -> bool {
        self.cpu_millis >= need.cpu_millis
            && self.memory_mb >= need.memory_mb
            && need.tags.is_subset(&self.tags)
    }

    /// Capacity left over after placing `need`. Callers check `fits` first.
    pub fn minus(&self, need: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(need.cpu_millis),
            memory_mb: self.memory_mb.saturating_sub(need.memory_mb),
            tags: self.tags.clone(),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.cpu_millis == 0 || self.memory_mb == 0
    }

    /// No CPU or memory declared.
    pub fn is_unspecified(&self) -> bool {
        self.cpu_millis == 0 && self.memory_mb == 0
    }

    /// What this requirement actually reserves on a worker of `capacity`.
    pub fn claim_on(&self, capacity: &Resources) -> Resources {
        if !self.is_unspecified() {
            return self.clone();
        }
        Resources {
            cpu_millis: capacity.cpu_millis,
            memory_mb: capacity.memory_mb,
            tags: self.tags.clone(),
        }
    }
}

/// Health state of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerHealth {
    Available,
    Busy,
    Unreachable,
    Draining,
}

impl std::fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerHealth::Available => write!(f, "available"),
            WorkerHealth::Busy => write!(f, "busy"),
            WorkerHealth::Unreachable => write!(f, "unreachable"),
            WorkerHealth::Draining => write!(f, "draining"),
        }
    }
}

/// A worker known to the cluster view.
///
/// `Available` and `Busy` are derived from reservations; `Unreachable` and
/// `Draining` are set by membership signals and override the derived state
/// until cleared.
#[derive(Debug, Clone)]
pub struct WorkerNode {
    pub id: WorkerId,
    pub address: String,
    pub capacity: Resources,
    pub health: WorkerHealth,
    pub generation: u64,
    pub last_heartbeat: Instant,
    pub unreachable_since: Option<Instant>,
    reservations: BTreeMap<TaskKey, Resources>,
}

impl WorkerNode {
    pub fn new(id: impl Into<WorkerId>, address: impl Into<String>, capacity: Resources) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            capacity,
            health: WorkerHealth::Available,
            generation: 0,
            last_heartbeat: Instant::now(),
            unreachable_since: None,
            reservations: BTreeMap::new(),
        }
    }

    pub fn remaining(&self) -> Resources {
        self.reservations
            .values()
            .fold(self.capacity.clone(), |left, used| left.minus(used))
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskKey> {
        self.reservations.keys()
    }

    pub fn holds(&self, task: &TaskKey) -> bool {
        self.reservations.contains_key(task)
    }

    pub(crate) fn reserve(&mut self, task: TaskKey, need: Resources) {
        self.reservations.insert(task, need);
        self.refresh_health();
    }

    pub(crate) fn release(&mut self, task: &TaskKey) -> bool {
        let removed = self.reservations.remove(task).is_some();
        self.refresh_health();
        removed
    }

    /// Recompute Available/Busy. Unreachable and Draining are sticky.
    pub(crate) fn refresh_health(&mut self) {
        if matches!(
            self.health,
            WorkerHealth::Unreachable | WorkerHealth::Draining
        ) {
            return;
        }
        self.health = if self.remaining().is_exhausted() {
            WorkerHealth::Busy
        } else {
            WorkerHealth::Available
        };
    }
}
