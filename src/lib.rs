//! taskd: a background task-processing daemon.
//!
//! One orchestrator process spawns a worker process per task. Each worker
//! assembles a [`task::TaskManager`] from pluggable components and loops:
//! wait for its trigger, load its queue, execute the items in order.

pub mod config;
pub mod daemon;
pub mod error;
pub mod task;
pub mod tasks;
