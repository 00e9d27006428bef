use crate::cluster::{Resources, WorkerId, WorkerSnapshot};
use crate::scheduler::job::TaskKey;

/// A runnable task waiting for placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    pub task: TaskKey,
    pub resources: Resources,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task: TaskKey,
    pub worker_id: WorkerId,
}

/// Placement algorithm used by a scheduling pass.
pub trait PlacementAlgorithm: Send {
    /// Map tasks to workers. Tasks are given in priority order; the result
    /// may be partial. Must be deterministic for identical input.
    fn assign(&self, tasks: &[PlacementRequest], workers: &[WorkerSnapshot]) -> Vec<Assignment>;

    fn name(&self) -> &'static str;
}

/// Greedy best-fit bin packing.
///
/// Each task, in the order given, goes to the worker whose remaining capacity
/// is the smallest that still fits it (CPU first, then memory, ties broken by
/// worker id). Capacity consumed earlier in the pass is subtracted before the
/// next task is considered. A task with no declared CPU or memory only fits
/// an idle worker and takes all of it.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestFit;

impl BestFit {
    pub fn new() -> Self {
        Self
    }
}

impl PlacementAlgorithm for BestFit {
    fn assign(&self, tasks: &[PlacementRequest], workers: &[WorkerSnapshot]) -> Vec<Assignment> {
        let mut remaining: Vec<(WorkerId, &Resources, Resources)> = workers
            .iter()
            .map(|w| (w.id.clone(), &w.capacity, w.remaining.clone()))
            .collect();
        let mut assignments = Vec::new();

        for request in tasks {
            let best = remaining
                .iter()
                .enumerate()
                .filter_map(|(idx, (id, capacity, left))| {
                    let claim = request.resources.claim_on(capacity);
                    (!left.is_exhausted() && left.fits(&claim)).then(|| {
                        let key = (
                            left.cpu_millis - claim.cpu_millis,
                            left.memory_mb - claim.memory_mb,
                            id.clone(),
                        );
                        (idx, key, claim)
                    })
                })
                .min_by(|a, b| a.1.cmp(&b.1))
                .map(|(idx, _, claim)| (idx, claim));

            match best {
                Some((idx, claim)) => {
                    let (id, _, left) = &mut remaining[idx];
                    *left = left.minus(&claim);
                    assignments.push(Assignment {
                        task: request.task.clone(),
                        worker_id: id.clone(),
                    });
                }
                None => {
                    tracing::debug!(task = %request.task, "No worker fits task, deferring");
                }
            }
        }

        assignments
    }

    fn name(&self) -> &'static str {
        "best_fit"
    }
}
