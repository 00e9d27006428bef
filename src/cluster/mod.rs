//! Cluster view: the scheduler's picture of which workers can receive work.
//!
//! Membership and health changes are pushed in as [`MembershipEvent`]s by an
//! external provider and applied with per-worker compare-and-set. The task
//! assigner reads [`WorkerSnapshot`]s and never blocks on the workers.

pub mod memory;
pub mod view;
pub mod worker;

pub use memory::InMemoryCluster;
pub use view::{ClusterView, MembershipEvent, MembershipKind, WorkerSnapshot};
pub use worker::{Resources, WorkerHealth, WorkerId, WorkerNode};
