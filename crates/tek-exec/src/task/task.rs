//! Task handle and the task-side API

use super::current::{current, current_id, set_current};
use super::{TaskBuilder, TaskId, TaskStatus};
use crate::atom::{Atom, AtomMode, AtomTarget};
use crate::exec::{ExecRequest, ExecShared};
use crate::memory::{HostManager, MemBlock, MemManager, MemPolicy};
use crate::port::{Envelope, MsgFlags, MsgId, MsgPort, MsgStatus};
use crate::signal::{TaskSignals, SIG_SINGLE, SIG_USER};
use crate::{ExecError, ExecResult};
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tek_hal::{HostPrimitives, HostThread};

/// Role of a task in the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// The thread that started the runtime
    Main,
    /// Exec and loader tasks
    System,
    /// Created through [`Task::create_task`]
    Child,
}

type UserData = Arc<dyn Any + Send + Sync>;

/// A task
///
/// Handles are shared; the task's ports, heap and signal table go away with
/// the last handle. Blocking calls (`wait`, `send_msg`, requests to the exec
/// task) must be made from the task's own thread.
pub struct Task {
    id: TaskId,
    name: Option<String>,
    kind: TaskKind,
    host: Arc<dyn HostPrimitives>,
    exec: Weak<ExecShared>,
    signals: Arc<TaskSignals>,
    status: AtomicCell<TaskStatus>,
    heap: MemManager,
    user_port: Arc<MsgPort>,
    sync_port: Arc<MsgPort>,
    data: Mutex<Option<UserData>>,
    thread: Mutex<Option<HostThread>>,
}

impl Task {
    pub(crate) fn new(
        name: Option<String>,
        kind: TaskKind,
        exec: Weak<ExecShared>,
        host: Arc<dyn HostPrimitives>,
    ) -> Arc<Self> {
        let id = TaskId::new();
        let signals = Arc::new(TaskSignals::new(id));
        let heap: MemManager = Arc::new(HostManager::new(host.clone(), MemPolicy::MEM_MANAGER));
        let user_port = Arc::new(MsgPort::new(signals.clone(), SIG_USER, false));
        let sync_port = Arc::new(MsgPort::new(signals.clone(), SIG_SINGLE, false));
        tracing::trace!(task = %id, name = name.as_deref().unwrap_or(""), "task created");
        Arc::new(Self {
            id,
            name,
            kind,
            host,
            exec,
            signals,
            status: AtomicCell::new(TaskStatus::Initializing),
            heap,
            user_port,
            sync_port,
            data: Mutex::new(None),
            thread: Mutex::new(None),
        })
    }

    /// Start the task's thread running `entry`, with the task bound to it
    pub(crate) fn start(
        self: &Arc<Self>,
        entry: impl FnOnce(&Arc<Task>) + Send + 'static,
    ) -> ExecResult<()> {
        let task = self.clone();
        let name = self.name.clone().unwrap_or_else(|| self.id.to_string());
        let thread = self.host.spawn_thread(
            &name,
            Box::new(move || {
                let previous = set_current(Some(task.clone()));
                entry(&task);
                set_current(previous);
            }),
        )?;
        *self.thread.lock() = Some(thread);
        Ok(())
    }

    /// Wait for the task's thread, if it has one
    pub(crate) fn join(&self) -> ExecResult<()> {
        let thread = self.thread.lock().take();
        match thread {
            Some(thread) => Ok(self.host.join_thread(thread)?),
            None => Ok(()),
        }
    }

    /// Task identity
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Task name, if named
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Lifecycle state
    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    pub(crate) fn set_status(&self, status: TaskStatus) {
        self.status.store(status);
    }

    pub(crate) fn kind(&self) -> TaskKind {
        self.kind
    }

    pub(crate) fn signals(&self) -> &Arc<TaskSignals> {
        &self.signals
    }

    pub(crate) fn exec(&self) -> ExecResult<Arc<ExecShared>> {
        self.exec.upgrade().ok_or(ExecError::ShutDown)
    }

    fn debug_check_current(&self) {
        debug_assert!(
            current_id().map_or(true, |id| id == self.id),
            "blocking call on a task from another task's thread"
        );
    }

    /// General-purpose port, signalled with [`SIG_USER`]
    pub fn user_port(&self) -> &Arc<MsgPort> {
        &self.user_port
    }

    /// Reply port of two-way sends, signalled with [`SIG_SINGLE`]
    pub fn sync_port(&self) -> &Arc<MsgPort> {
        &self.sync_port
    }

    /// The task's private heap
    pub fn heap(&self) -> &MemManager {
        &self.heap
    }

    /// User data
    pub fn data(&self) -> Option<UserData> {
        self.data.lock().clone()
    }

    /// Replace the user data, returning the old value
    pub fn set_data(&self, data: Option<UserData>) -> Option<UserData> {
        std::mem::replace(&mut *self.data.lock(), data)
    }

    // Signals

    /// Allocate signal bits; zero picks the lowest free bit
    pub fn alloc_signal(&self, mask: u32) -> Option<u32> {
        self.signals.alloc(mask)
    }

    /// Return signal bits
    pub fn free_signal(&self, mask: u32) {
        self.signals.release(mask);
    }

    /// Currently allocated signal bits
    pub fn used_signals(&self) -> u32 {
        self.signals.used()
    }

    /// Raise signals on this task
    pub fn signal(&self, mask: u32) {
        self.signals.signal(mask);
    }

    /// Replace the pending bits under `mask` with `new`, returning the old pending set
    pub fn set_signal(&self, new: u32, mask: u32) -> u32 {
        self.signals.event().set_signal(new, mask)
    }

    /// Block until one of `mask` is raised; clears and returns the raised bits
    pub fn wait(&self, mask: u32) -> u32 {
        debug_assert_eq!(mask & !self.signals.used(), 0, "waiting on unallocated signals");
        self.debug_check_current();
        self.signals.event().wait(mask)
    }

    pub(crate) fn wait_timeout(&self, mask: u32, timeout: Duration) -> u32 {
        debug_assert_eq!(mask & !self.signals.used(), 0, "waiting on unallocated signals");
        self.signals.event().wait_timeout(mask, timeout)
    }

    // Ports and messages

    /// Create a port signalled with a freshly allocated bit, freed with the port
    pub fn create_port(&self) -> ExecResult<Arc<MsgPort>> {
        let signal = self.signals.alloc(0).ok_or(ExecError::SignalsExhausted)?;
        Ok(Arc::new(MsgPort::new(self.signals.clone(), signal, true)))
    }

    /// Create a port signalled with bits the task already holds
    pub fn create_port_with_signal(&self, signal: u32) -> Arc<MsgPort> {
        debug_assert_eq!(signal & !self.signals.used(), 0, "port signal not allocated");
        Arc::new(MsgPort::new(self.signals.clone(), signal, false))
    }

    /// Allocate a zeroed message payload from the exec message manager
    pub fn alloc_msg(&self, size: usize) -> Option<Box<Envelope<MemBlock>>> {
        let exec = self.exec.upgrade()?;
        MemBlock::alloc(exec.msg_manager(), size).map(Envelope::new)
    }

    /// Send `msg` and block until it comes back
    pub fn send_msg<T: Any + Send>(
        &self,
        port: &MsgPort,
        msg: Box<Envelope<T>>,
    ) -> (MsgStatus, Box<Envelope<T>>) {
        self.debug_check_current();
        let id = msg.id();
        port.put(Some(self.sync_port.clone()), msg);
        self.wait_reply(id)
    }

    /// Collect message `id` from the sync port, leaving other replies queued
    pub(crate) fn wait_reply<T: Any + Send>(&self, id: MsgId) -> (MsgStatus, Box<Envelope<T>>) {
        loop {
            if let Some(reply) = self.sync_port.remove(id) {
                let status = reply.status();
                match reply.downcast::<T>() {
                    Ok(mut envelope) => {
                        envelope.flags = MsgFlags::NONE;
                        return (status, envelope);
                    }
                    Err(_) => unreachable!("message {:?} changed payload type in flight", id),
                }
            }
            self.signals.event().wait(SIG_SINGLE);
            if !self.sync_port.contains(id) {
                tracing::debug!(task = %self.id, "signal on sync port, no reply");
            }
        }
    }

    /// Submit a request to the exec task and wait for its answer
    pub(crate) fn exec_request(&self, request: ExecRequest) -> ExecResult<(MsgStatus, ExecRequest)> {
        self.debug_check_current();
        let exec = self.exec()?;
        let msg = Envelope::new(request);
        let id = msg.id();
        exec.submit(Some(self.sync_port.clone()), msg)?;
        drop(exec);
        let (status, reply) = self.wait_reply::<ExecRequest>(id);
        Ok((status, reply.into_body()))
    }

    // Task directory

    /// Look up a task by name, or the calling thread's task for `None`
    pub fn find_task(&self, name: Option<&str>) -> Option<Arc<Task>> {
        match name {
            None => current(),
            Some(name) => self.exec.upgrade()?.find_task(name),
        }
    }

    /// Create a child task; returns once its init hook has succeeded
    pub fn create_task(&self, builder: TaskBuilder) -> ExecResult<Arc<Task>> {
        let name = builder.name.clone();
        let (status, reply) = self.exec_request(ExecRequest::CreateTask {
            builder: Some(builder),
            result: None,
        })?;
        match reply {
            ExecRequest::CreateTask {
                result: Some(result),
                ..
            } => result,
            _ if status == MsgStatus::Failed => Err(ExecError::ShutDown),
            _ => Err(ExecError::TaskInitFailed(name.unwrap_or_default())),
        }
    }

    /// Block until `target` has finished, then release it
    pub fn destroy_task(&self, target: &Arc<Task>) -> ExecResult<()> {
        if target.id == self.id {
            return Err(ExecError::DestroySelf);
        }
        if target.kind != TaskKind::Child {
            return Err(ExecError::Unsupported("only child tasks can be destroyed"));
        }
        let (status, _) = self.exec_request(ExecRequest::DestroyTask {
            task: target.clone(),
        })?;
        match status {
            MsgStatus::Failed => Err(ExecError::ShutDown),
            _ => Ok(()),
        }
    }

    // Atoms

    /// Lock an atom; `None` if denied, absent or destroyed while waiting
    ///
    /// With [`AtomMode::DESTROY`] the atom is unlocked again with destroy
    /// semantics and the now detached handle returned.
    pub fn lock_atom(&self, target: impl Into<AtomTarget>, mode: AtomMode) -> Option<Arc<Atom>> {
        let request = ExecRequest::LockAtom {
            target: target.into(),
            mode,
            requester: self.id,
            atom: None,
        };
        let atom = match self.exec_request(request) {
            Ok((_, ExecRequest::LockAtom { atom, .. })) => atom?,
            Ok(_) => return None,
            Err(err) => {
                tracing::debug!(%err, "lock atom request failed");
                return None;
            }
        };
        if mode.contains(AtomMode::DESTROY) {
            self.unlock_atom(&atom, AtomMode::DESTROY);
        }
        Some(atom)
    }

    /// Release one nesting level of an atom lock
    pub fn unlock_atom(&self, atom: &Arc<Atom>, mode: AtomMode) {
        let request = ExecRequest::UnlockAtom {
            atom: atom.clone(),
            mode,
            requester: self.id,
        };
        if let Err(err) = self.exec_request(request) {
            tracing::warn!(%err, atom = atom.name(), "unlock atom request failed");
        }
    }

    // Time

    /// Time since the runtime's host clock origin
    pub fn system_time(&self) -> Duration {
        Duration::from_micros(self.host.monotonic_micros())
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        tracing::trace!(task = %self.id, "task released");
    }
}
