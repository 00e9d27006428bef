//! Scheduling and recovery engine for a distributed task-execution platform.
//!
//! Jobs made of tasks are placed onto workers by best-fit bin packing. Every
//! job and task transition is recorded in a write-ahead saga log before it
//! takes effect, so a restarted scheduler rebuilds its exact state by
//! replaying the log.

pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod saga;
pub mod scheduler;
pub mod shutdown;
pub mod stats;
pub mod worker;

pub use error::{Result, SchedulerError};
