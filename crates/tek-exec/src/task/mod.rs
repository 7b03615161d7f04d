//! Tasks
//!
//! A task is one native thread with its own signal table, a user port, a
//! sync port for two-way sends and a private heap. Tasks are created and
//! destroyed through the exec task; the thread that starts the runtime is
//! adopted as the main task.

mod builder;
mod current;
mod id;
#[allow(clippy::module_inception)]
mod task;

pub use builder::{InitHook, RunHook, TaskBuilder};
pub(crate) use current::{current, current_id, set_current};
pub use id::{TaskId, TaskStatus};
pub(crate) use task::TaskKind;
pub use task::Task;

use crate::{ExecError, ExecResult};
use std::sync::Arc;

/// Task bound to the calling thread
pub fn current_task() -> ExecResult<Arc<Task>> {
    current().ok_or(ExecError::NoCurrentTask)
}
