//! Job and task lifecycle.
//!
//! [`Scheduler`] owns all job state and mutates it only by logging a saga
//! transition and folding it through [`SchedulerState::apply`].
//! [`RecoveryCoordinator`] rebuilds a scheduler from the log at startup.

pub mod assigner;
pub mod compensation;
pub mod engine;
pub mod events;
pub mod job;
pub mod recovery;
pub mod state;

pub use assigner::{Assignment, BestFit, PlacementAlgorithm, PlacementRequest};
pub use compensation::{AbortCompensator, CompensationOutcome, Compensator};
pub use engine::{PassReport, RecoveryReport, Scheduler};
pub use events::{EventOutcome, WorkerCommand, WorkerEvent, WorkerEventKind};
pub use job::{Job, JobId, JobSpec, JobState, Task, TaskId, TaskKey, TaskSpec, TaskState};
pub use recovery::RecoveryCoordinator;
pub use state::SchedulerState;
