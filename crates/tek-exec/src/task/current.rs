//! The task bound to the calling thread

use super::Task;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    /// Task running on this thread.
    static CURRENT: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Bind `task` to this thread, returning the previous binding
pub(crate) fn set_current(task: Option<Arc<Task>>) -> Option<Arc<Task>> {
    CURRENT.with(|current| current.replace(task))
}

/// Task bound to the calling thread, if any
pub(crate) fn current() -> Option<Arc<Task>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Identity of the task bound to the calling thread
pub(crate) fn current_id() -> Option<super::TaskId> {
    CURRENT.with(|current| current.borrow().as_ref().map(|task| task.id()))
}
