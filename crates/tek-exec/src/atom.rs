//! Named atoms
//!
//! An atom is a named, process-wide lock with an attached data slot. Its
//! state machine is only ever evaluated by the exec task; tasks reach it
//! through [`crate::Task::lock_atom`] and [`crate::Task::unlock_atom`].

use crate::task::TaskId;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// Lock mode bits
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AtomMode(u32);

impl AtomMode {
    /// Exclusive, blocking lock of an existing atom
    pub const EXCLUSIVE: Self = Self(0);
    /// Create the atom if absent
    pub const CREATE: Self = Self(1);
    /// Destroy the atom on the final unlock
    pub const DESTROY: Self = Self(2);
    /// Shared instead of exclusive
    pub const SHARED: Self = Self(4);
    /// Look up by name; implied by a name target
    pub const NAME: Self = Self(8);
    /// Fail instead of waiting
    pub const TRY: Self = Self(0x10);

    /// Whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for AtomMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for AtomMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomMode({:#x})", self.0)
    }
}

type AtomData = Arc<dyn Any + Send + Sync>;

/// Handle to a named atom
pub struct Atom {
    name: String,
    data: Mutex<Option<AtomData>>,
}

impl Atom {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            data: Mutex::new(None),
        })
    }

    /// Atom name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attached data
    pub fn data(&self) -> Option<AtomData> {
        self.data.lock().clone()
    }

    /// Replace the attached data, returning the old value
    pub fn set_data(&self, data: Option<AtomData>) -> Option<AtomData> {
        std::mem::replace(&mut *self.data.lock(), data)
    }
}

impl fmt::Debug for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom").field("name", &self.name).finish()
    }
}

/// What a lock request refers to
#[derive(Debug, Clone)]
pub enum AtomTarget {
    /// Atom looked up (or created) by name
    Name(String),
    /// Atom handle from an earlier lock
    Handle(Arc<Atom>),
}

impl From<&str> for AtomTarget {
    fn from(name: &str) -> Self {
        AtomTarget::Name(name.to_string())
    }
}

impl From<String> for AtomTarget {
    fn from(name: String) -> Self {
        AtomTarget::Name(name)
    }
}

impl From<Arc<Atom>> for AtomTarget {
    fn from(atom: Arc<Atom>) -> Self {
        AtomTarget::Handle(atom)
    }
}

impl From<&Arc<Atom>> for AtomTarget {
    fn from(atom: &Arc<Atom>) -> Self {
        AtomTarget::Handle(atom.clone())
    }
}

/// Lock state of an atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomState {
    /// Not held
    Unlocked,
    /// Held by one owner, possibly nested
    Exclusive,
    /// Held by any number of sharers
    Shared,
}

struct AtomWaiter<W> {
    task: TaskId,
    shared: bool,
    pending: W,
}

struct AtomSlot<W> {
    atom: Arc<Atom>,
    state: AtomState,
    nest: usize,
    owner: Option<TaskId>,
    waiters: VecDeque<AtomWaiter<W>>,
}

impl<W> AtomSlot<W> {
    fn take(&mut self, requester: TaskId, shared: bool) {
        if self.nest != 0 {
            tracing::error!(atom = self.atom.name(), nest = self.nest, "unlocked atom with nest count");
        }
        if shared {
            self.state = AtomState::Shared;
            self.owner = None;
        } else {
            self.state = AtomState::Exclusive;
            self.owner = Some(requester);
        }
        self.nest = 1;
    }
}

/// Result of a lock request
pub(crate) enum LockOutcome<W> {
    /// Lock held; answer the requester with the atom
    Granted(Arc<Atom>, W),
    /// Refused; answer the requester without an atom
    Denied(W),
    /// Requester queued until an unlock
    Queued,
}

/// A queued requester released by an unlock
pub(crate) struct Wake<W> {
    /// Granted atom, or `None` when the atom was destroyed
    pub atom: Option<Arc<Atom>>,
    pub pending: W,
}

/// All named atoms and their lock state
///
/// `W` is whatever answers a queued requester later, typically the pending
/// request message.
pub(crate) struct AtomTable<W> {
    slots: FxHashMap<String, AtomSlot<W>>,
}

impl<W> Default for AtomTable<W> {
    fn default() -> Self {
        Self {
            slots: FxHashMap::default(),
        }
    }
}

impl<W> AtomTable<W> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// State, nest count and exclusive owner of a named atom
    #[cfg(test)]
    pub fn state(&self, name: &str) -> Option<(AtomState, usize, Option<TaskId>)> {
        self.slots
            .get(name)
            .map(|slot| (slot.state, slot.nest, slot.owner))
    }

    /// Number of requesters queued on a named atom
    pub fn waiting(&self, name: &str) -> usize {
        self.slots.get(name).map_or(0, |slot| slot.waiters.len())
    }

    fn slot_for(&mut self, atom: &Arc<Atom>) -> Option<&mut AtomSlot<W>> {
        self.slots
            .get_mut(atom.name())
            .filter(|slot| Arc::ptr_eq(&slot.atom, atom))
    }

    pub fn lock(
        &mut self,
        target: AtomTarget,
        mode: AtomMode,
        requester: TaskId,
        pending: W,
    ) -> LockOutcome<W> {
        let shared = mode.contains(AtomMode::SHARED);
        let slot = match target {
            AtomTarget::Name(name) => {
                if !self.slots.contains_key(&name) {
                    if !mode.contains(AtomMode::CREATE) {
                        return LockOutcome::Denied(pending);
                    }
                    let atom = Atom::new(name.clone());
                    let mut slot = AtomSlot {
                        atom: atom.clone(),
                        state: AtomState::Unlocked,
                        nest: 0,
                        owner: None,
                        waiters: VecDeque::new(),
                    };
                    slot.take(requester, shared);
                    tracing::trace!(atom = %name, shared, "atom created");
                    self.slots.insert(name, slot);
                    return LockOutcome::Granted(atom, pending);
                }
                if mode.contains(AtomMode::CREATE) && mode.contains(AtomMode::TRY) {
                    return LockOutcome::Denied(pending);
                }
                match self.slots.get_mut(&name) {
                    Some(slot) => slot,
                    None => return LockOutcome::Denied(pending),
                }
            }
            AtomTarget::Handle(atom) => {
                if mode.contains(AtomMode::CREATE) {
                    return LockOutcome::Denied(pending);
                }
                match self.slot_for(&atom) {
                    Some(slot) => slot,
                    None => return LockOutcome::Denied(pending),
                }
            }
        };

        let nested = match slot.state {
            AtomState::Unlocked => {
                slot.take(requester, shared);
                return LockOutcome::Granted(slot.atom.clone(), pending);
            }
            AtomState::Shared => shared,
            AtomState::Exclusive => slot.owner == Some(requester),
        };
        if nested {
            slot.nest += 1;
            return LockOutcome::Granted(slot.atom.clone(), pending);
        }
        if mode.contains(AtomMode::TRY) {
            return LockOutcome::Denied(pending);
        }
        slot.waiters.push_back(AtomWaiter {
            task: requester,
            shared,
            pending,
        });
        tracing::trace!(atom = slot.atom.name(), waiters = slot.waiters.len(), "must wait");
        LockOutcome::Queued
    }

    /// Release one nesting level and return the waiters to answer
    pub fn unlock(&mut self, atom: &Arc<Atom>, mode: AtomMode, requester: TaskId) -> Vec<Wake<W>> {
        let Some(slot) = self.slot_for(atom) else {
            tracing::warn!(atom = atom.name(), "unlock of an atom that no longer exists");
            return Vec::new();
        };
        if slot.nest == 0 {
            tracing::error!(atom = atom.name(), "unlock of an atom that is not locked");
            debug_assert!(false, "unlock of an atom that is not locked");
            return Vec::new();
        }
        if slot.state == AtomState::Exclusive && slot.owner != Some(requester) {
            tracing::warn!(atom = atom.name(), task = %requester, "atom unlocked by a task that does not own it");
        }

        slot.nest -= 1;
        if slot.nest > 0 {
            return Vec::new();
        }
        slot.state = AtomState::Unlocked;
        slot.owner = None;

        if mode.contains(AtomMode::DESTROY) {
            let waiters = std::mem::take(&mut slot.waiters);
            self.slots.remove(atom.name());
            tracing::trace!(atom = atom.name(), "atom destroyed");
            return waiters
                .into_iter()
                .map(|waiter| Wake {
                    atom: None,
                    pending: waiter.pending,
                })
                .collect();
        }

        let Some(first) = slot.waiters.pop_front() else {
            return Vec::new();
        };
        let mut wakes = Vec::new();
        slot.nest = 1;
        if first.shared {
            slot.state = AtomState::Shared;
            wakes.push(first.pending);
            // every other shared waiter joins in the same pass
            let mut rest = VecDeque::with_capacity(slot.waiters.len());
            for waiter in slot.waiters.drain(..) {
                if waiter.shared {
                    slot.nest += 1;
                    wakes.push(waiter.pending);
                } else {
                    rest.push_back(waiter);
                }
            }
            slot.waiters = rest;
        } else {
            slot.state = AtomState::Exclusive;
            slot.owner = Some(first.task);
            wakes.push(first.pending);
        }
        let atom = slot.atom.clone();
        wakes
            .into_iter()
            .map(|pending| Wake {
                atom: Some(atom.clone()),
                pending,
            })
            .collect()
    }

    /// Remove every queued requester
    pub fn abandon(&mut self) -> Vec<W> {
        self.slots
            .values_mut()
            .flat_map(|slot| std::mem::take(&mut slot.waiters))
            .map(|waiter| waiter.pending)
            .collect()
    }
}
