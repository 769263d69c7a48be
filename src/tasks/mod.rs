//! Tasks shipped with the daemon.

pub mod sleep;

use crate::task::ComponentRegistry;

/// Register every bundled task's task-specific components.
pub fn register_all(registry: &mut ComponentRegistry) {
    sleep::register(registry, sleep::TASK_NAME);
}
