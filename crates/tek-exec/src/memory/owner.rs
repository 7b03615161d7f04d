//! Interior state of memory managers

use parking_lot::Mutex;

/// Manager state behind a mutex
///
/// A single-owner cell never waits: contention means the manager is being
/// shared across tasks without a task-safe wrapper, which is reported and
/// answered with a failed call. A shared cell serializes callers.
pub(crate) struct OwnerCell<T> {
    inner: Mutex<T>,
    shared: bool,
}

impl<T> OwnerCell<T> {
    pub fn exclusive(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            shared: false,
        }
    }

    #[cfg(test)]
    pub fn shared(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            shared: true,
        }
    }

    /// Run `f` on the state; `None` if a single-owner cell is contended
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        if self.shared {
            return Some(f(&mut self.inner.lock()));
        }
        match self.inner.try_lock() {
            Some(mut guard) => Some(f(&mut guard)),
            None => {
                tracing::error!("concurrent use of a memory manager that is not task-safe");
                debug_assert!(false, "concurrent use of a memory manager that is not task-safe");
                None
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}
