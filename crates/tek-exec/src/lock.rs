//! Recursive task locks
//!
//! Unlike atoms, a [`Lock`] is held directly by the locking task without a
//! round trip through the exec task. Contended lockers queue in FIFO order
//! and are handed ownership on release; the hand-off is signalled with
//! [`SIG_SINGLE`].

use crate::signal::{TaskSignals, SIG_SINGLE};
use crate::task::{Task, TaskId};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

struct LockState {
    owner: Option<TaskId>,
    nest: usize,
    waiters: VecDeque<Arc<TaskSignals>>,
}

/// A recursive lock owned by tasks
pub struct Lock {
    state: Mutex<LockState>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// Unlocked lock
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                nest: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Acquire the lock for `task`, blocking while another task holds it
    ///
    /// Must be called from `task`'s own thread. Re-locking by the owner
    /// nests.
    pub fn lock(&self, task: &Task) {
        {
            let mut state = self.state.lock();
            match state.owner {
                None => {
                    state.owner = Some(task.id());
                    state.nest = 1;
                    return;
                }
                Some(owner) if owner == task.id() => {
                    state.nest += 1;
                    return;
                }
                Some(_) => state.waiters.push_back(task.signals().clone()),
            }
        }
        tracing::trace!(task = %task.id(), "waiting for lock");
        loop {
            task.wait(SIG_SINGLE);
            if self.state.lock().owner == Some(task.id()) {
                return;
            }
        }
    }

    /// Acquire the lock if free or already held by `task`
    pub fn attempt_lock(&self, task: &Task) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(task.id());
                state.nest = 1;
                true
            }
            Some(owner) if owner == task.id() => {
                state.nest += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one nesting level; the last one hands off to the next waiter
    pub fn unlock(&self, task: &Task) {
        let next = {
            let mut state = self.state.lock();
            if state.owner != Some(task.id()) || state.nest == 0 {
                tracing::error!(task = %task.id(), "unlock of a lock not held by the task");
                debug_assert!(false, "unlock of a lock not held by the task");
                return;
            }
            state.nest -= 1;
            if state.nest > 0 {
                return;
            }
            match state.waiters.pop_front() {
                Some(next) => {
                    state.owner = Some(next.task());
                    state.nest = 1;
                    next
                }
                None => {
                    state.owner = None;
                    return;
                }
            }
        };
        next.signal(SIG_SINGLE);
    }

    /// Current owner, if locked
    pub fn owner(&self) -> Option<TaskId> {
        self.state.lock().owner
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Lock")
            .field("owner", &state.owner)
            .field("nest", &state.nest)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.nest > 0 {
            tracing::warn!(nest = state.nest, "lock dropped while held");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;
    use std::sync::Weak;
    use tek_hal::default_host;

    fn task() -> Arc<Task> {
        Task::new(None, TaskKind::Child, Weak::new(), default_host())
    }

    #[test]
    fn test_recursive_lock() {
        let lock = Lock::new();
        let a = task();
        let b = task();
        lock.lock(&a);
        lock.lock(&a);
        assert!(!lock.attempt_lock(&b));
        lock.unlock(&a);
        assert_eq!(lock.owner(), Some(a.id()));
        lock.unlock(&a);
        assert_eq!(lock.owner(), None);
        assert!(lock.attempt_lock(&b));
        lock.unlock(&b);
    }

    #[test]
    fn test_hand_off_to_waiter() {
        crate::test_utils::init_test_logging();
        let lock = Arc::new(Lock::new());
        let holder = task();
        let waiter = task();
        lock.lock(&holder);

        let handle = {
            let lock = lock.clone();
            let waiter = waiter.clone();
            std::thread::spawn(move || {
                lock.lock(&waiter);
                let owner = lock.owner();
                lock.unlock(&waiter);
                owner
            })
        };
        while lock.state.lock().waiters.is_empty() {
            std::thread::yield_now();
        }
        lock.unlock(&holder);
        assert_eq!(handle.join().unwrap(), Some(waiter.id()));
        assert_eq!(lock.owner(), None);
    }
}
