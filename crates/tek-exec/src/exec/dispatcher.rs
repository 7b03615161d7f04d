//! The exec task's request loop

use super::exec::{ExecShared, ModuleSlot, ModuleState};
use super::request::{ExecRequest, LoadFailure, LoadRequest};
use crate::atom::LockOutcome;
use crate::memory::MemBlock;
use crate::module::Module;
use crate::port::{drop_msg, reply_msg, Envelope, Message, MsgPort, MsgStatus};
use crate::signal::{TaskSignals, SIG_ABORT, SIG_CHILDEXIT, SIG_CHILDINIT, SIG_USER};
use crate::task::{Task, TaskBuilder, TaskKind, TaskStatus};
use crate::{ExecError, ExecResult};
use crossbeam::atomic::AtomicCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type Request = Box<Envelope<ExecRequest>>;

/// A child whose init hook has not reported yet
struct Initializing {
    task: Arc<Task>,
    init: Arc<AtomicCell<Option<bool>>>,
    request: Request,
}

pub(crate) struct Dispatcher {
    shared: Arc<ExecShared>,
    task: Arc<Task>,
    modreply: Arc<MsgPort>,
    initializing: Vec<Initializing>,
    exiting: Vec<Request>,
}

impl Dispatcher {
    pub fn new(shared: Arc<ExecShared>, task: Arc<Task>, modreply: Arc<MsgPort>) -> Self {
        Self {
            shared,
            task,
            modreply,
            initializing: Vec::new(),
            exiting: Vec::new(),
        }
    }

    pub fn run(mut self) {
        let mask = SIG_ABORT | SIG_USER | SIG_CHILDINIT | SIG_CHILDEXIT | self.modreply.signal();
        tracing::debug!(task = %self.task.id(), "exec running");
        loop {
            let signals = self.task.wait(mask);
            if signals & SIG_ABORT != 0 {
                break;
            }
            if signals & self.modreply.signal() != 0 {
                self.finish_loads();
            }
            if signals & SIG_CHILDINIT != 0 {
                self.child_init();
            }
            if signals & SIG_CHILDEXIT != 0 {
                self.child_exit();
            }
            if signals & SIG_USER != 0 {
                while let Some(msg) = self.task.user_port().get() {
                    self.dispatch(msg);
                }
            }
        }
        self.abandon();
        tracing::debug!(task = %self.task.id(), "exec exiting");
    }

    fn dispatch(&mut self, msg: Message) {
        let request = match msg.downcast::<ExecRequest>() {
            Ok(request) => request,
            Err(msg) => {
                tracing::warn!(msg = msg.id().as_u64(), "unexpected message on exec port");
                drop_msg(msg);
                return;
            }
        };
        tracing::trace!(request = ?request.body, "exec request");
        match request.body {
            ExecRequest::CreateTask { .. } => self.create_task(request),
            ExecRequest::DestroyTask { .. } => self.destroy_task(request),
            ExecRequest::LockAtom { .. } => self.lock_atom(request),
            ExecRequest::UnlockAtom { .. } => self.unlock_atom(request),
            ExecRequest::OpenModule { .. } => self.open_module(request),
            ExecRequest::CloseModule { .. } => self.close_module(request),
        }
    }

    // Tasks

    fn create_task(&mut self, mut request: Request) {
        let builder = match &mut request.body {
            ExecRequest::CreateTask { builder, .. } => builder.take(),
            _ => None,
        };
        let Some(builder) = builder else {
            drop_msg(request);
            return;
        };
        if builder.init.is_none() && builder.run.is_none() {
            answer_create(
                request,
                Err(ExecError::Unsupported("task needs an init or run hook")),
            );
            return;
        }
        if let Some(name) = builder.name.as_deref() {
            if self.name_taken(name) {
                answer_create(request, Err(ExecError::TaskNameTaken(name.to_string())));
                return;
            }
        }

        let task = Task::new(
            builder.name.clone(),
            TaskKind::Child,
            Arc::downgrade(&self.shared),
            self.shared.host.clone(),
        );
        let init = Arc::new(AtomicCell::new(None));
        if let Err(err) = start_child(&task, builder, self.task.signals().clone(), init.clone()) {
            tracing::warn!(%err, task = %task.id(), "could not start task thread");
            answer_create(request, Err(err));
            return;
        }
        tracing::debug!(task = %task.id(), name = task.name().unwrap_or(""), "task initializing");
        self.initializing.push(Initializing {
            task,
            init,
            request,
        });
    }

    fn name_taken(&self, name: &str) -> bool {
        let in_directory = self
            .shared
            .tables
            .lock()
            .tasks
            .values()
            .any(|task| task.name() == Some(name));
        in_directory
            || self
                .initializing
                .iter()
                .any(|pending| pending.task.name() == Some(name))
    }

    fn child_init(&mut self) {
        let mut index = 0;
        while index < self.initializing.len() {
            let Some(succeeded) = self.initializing[index].init.load() else {
                index += 1;
                continue;
            };
            let Initializing { task, request, .. } = self.initializing.remove(index);
            if succeeded {
                self.shared
                    .tables
                    .lock()
                    .tasks
                    .insert(task.id(), task.clone());
                tracing::debug!(task = %task.id(), "task running");
                answer_create(request, Ok(task));
            } else {
                if let Err(err) = task.join() {
                    tracing::warn!(%err, task = %task.id(), "failed task did not join cleanly");
                }
                let name = task.name().unwrap_or_default().to_string();
                tracing::debug!(task = %task.id(), "task init failed");
                let mut request = request;
                if let ExecRequest::CreateTask { result, .. } = &mut request.body {
                    *result = Some(Err(ExecError::TaskInitFailed(name)));
                }
                drop_msg(request);
            }
        }
        // a task may have finished before its init was reconciled
        self.child_exit();
    }

    fn destroy_task(&mut self, request: Request) {
        let finished = match &request.body {
            ExecRequest::DestroyTask { task } => task.status().is_terminal(),
            _ => false,
        };
        if finished {
            self.release_task(request);
        } else {
            self.exiting.push(request);
        }
    }

    fn child_exit(&mut self) {
        let (done, waiting): (Vec<Request>, Vec<Request>) =
            std::mem::take(&mut self.exiting)
                .into_iter()
                .partition(|request| match &request.body {
                    ExecRequest::DestroyTask { task } => task.status().is_terminal(),
                    _ => true,
                });
        self.exiting = waiting;
        for request in done {
            self.release_task(request);
        }
    }

    fn release_task(&mut self, request: Request) {
        if let ExecRequest::DestroyTask { task } = &request.body {
            self.shared.tables.lock().tasks.remove(&task.id());
            if let Err(err) = task.join() {
                tracing::warn!(%err, task = %task.id(), "task thread did not join cleanly");
            }
            tracing::debug!(task = %task.id(), status = ?task.status(), "task destroyed");
        }
        reply_msg(request);
    }

    // Atoms

    fn lock_atom(&mut self, request: Request) {
        let fields = match &request.body {
            ExecRequest::LockAtom {
                target,
                mode,
                requester,
                ..
            } => Some((target.clone(), *mode, *requester)),
            _ => None,
        };
        let Some((target, mode, requester)) = fields else {
            return drop_msg(request);
        };
        let outcome = self
            .shared
            .tables
            .lock()
            .atoms
            .lock(target, mode, requester, request);
        match outcome {
            LockOutcome::Granted(atom, request) => answer_lock(request, Some(atom)),
            LockOutcome::Denied(request) => answer_lock(request, None),
            LockOutcome::Queued => {}
        }
    }

    fn unlock_atom(&mut self, request: Request) {
        let wakes = match &request.body {
            ExecRequest::UnlockAtom {
                atom,
                mode,
                requester,
            } => self.shared.tables.lock().atoms.unlock(atom, *mode, *requester),
            _ => Vec::new(),
        };
        reply_msg(request);
        for wake in wakes {
            answer_lock(wake.pending, wake.atom);
        }
    }

    // Modules

    fn open_module(&mut self, request: Request) {
        let fields = match &request.body {
            ExecRequest::OpenModule { name, version, .. } => Some((name.clone(), *version)),
            _ => None,
        };
        let Some((name, version)) = fields else {
            return drop_msg(request);
        };

        let mut tables = self.shared.tables.lock();
        if let Some(slot) = tables.modules.get_mut(&name) {
            let have = slot.module.version();
            if have < version {
                drop(tables);
                return answer_open(
                    request,
                    Err(ExecError::ModuleVersion {
                        name,
                        have,
                        want: version,
                    }),
                );
            }
            match &mut slot.state {
                ModuleState::Loading(pending) => pending.push(request),
                ModuleState::Ready => {
                    slot.refcount += 1;
                    let module = slot.module.clone();
                    drop(tables);
                    answer_open(request, Ok(module));
                }
            }
            return;
        }

        let Some(entry) = tables
            .registry
            .iter()
            .rev()
            .find(|entry| entry.name() == name)
            .cloned()
        else {
            drop(tables);
            return answer_open(request, Err(ExecError::ModuleNotFound(name)));
        };
        if entry.version() < version {
            drop(tables);
            let have = entry.version();
            return answer_open(
                request,
                Err(ExecError::ModuleVersion {
                    name,
                    have,
                    want: version,
                }),
            );
        }
        let body = match entry.instance_size() {
            0 => None,
            size => match MemBlock::alloc(&self.shared.kernel_mm, size) {
                Some(block) => Some(block),
                None => {
                    drop(tables);
                    return answer_open(request, Err(ExecError::OutOfMemory(size)));
                }
            },
        };
        let module = Module::new(entry, body);
        tables.modules.insert(
            name.clone(),
            ModuleSlot {
                module: module.clone(),
                refcount: 0,
                state: ModuleState::Loading(vec![request]),
            },
        );
        drop(tables);

        tracing::debug!(module = %name, "loading module");
        match self.shared.loader_task.get() {
            Some(loader) => loader
                .user_port()
                .put(Some(self.modreply.clone()), Envelope::new(LoadRequest {
                    module,
                    failure: None,
                })),
            None => self.finish_load(module, Some(LoadFailure::InitFailed)),
        }
    }

    fn finish_loads(&mut self) {
        while let Some(msg) = self.modreply.get() {
            let reply = match msg.downcast::<LoadRequest>() {
                Ok(reply) => reply,
                Err(msg) => {
                    tracing::warn!(msg = msg.id().as_u64(), "unexpected message on module reply port");
                    continue;
                }
            };
            let status = reply.status();
            let LoadRequest { module, failure } = reply.into_body();
            let failure = match status {
                MsgStatus::Failed => Some(LoadFailure::InitFailed),
                _ => failure,
            };
            self.finish_load(module, failure);
        }
    }

    fn finish_load(&mut self, module: Arc<Module>, failure: Option<LoadFailure>) {
        let mut tables = self.shared.tables.lock();
        let Some(slot) = tables.modules.get_mut(module.name()) else {
            tracing::warn!(module = module.name(), "load finished for an unknown module");
            return;
        };
        let pending = match std::mem::replace(&mut slot.state, ModuleState::Ready) {
            ModuleState::Loading(pending) => pending,
            ModuleState::Ready => Vec::new(),
        };
        match failure {
            Some(failure) => {
                tables.modules.remove(module.name());
                drop(tables);
                tracing::warn!(module = module.name(), ?failure, "module failed to load");
                for request in pending {
                    answer_open(request, Err(failure.into_error(module.name())));
                }
            }
            None => {
                slot.refcount += pending.len();
                drop(tables);
                tracing::debug!(module = module.name(), openers = pending.len(), "module ready");
                for request in pending {
                    answer_open(request, Ok(module.clone()));
                }
            }
        }
    }

    fn close_module(&mut self, request: Request) {
        let module = match &request.body {
            ExecRequest::CloseModule { module } => Some(module.clone()),
            _ => None,
        };
        let Some(module) = module else {
            return drop_msg(request);
        };
        let unload = {
            let mut tables = self.shared.tables.lock();
            let last = match tables.modules.get_mut(module.name()) {
                Some(slot) if Arc::ptr_eq(&slot.module, &module) && slot.refcount > 0 => {
                    slot.refcount -= 1;
                    slot.refcount == 0 && matches!(slot.state, ModuleState::Ready)
                }
                _ => {
                    tracing::error!(module = module.name(), "close of a module that is not open");
                    debug_assert!(false, "close of a module that is not open");
                    false
                }
            };
            if last {
                tables.modules.remove(module.name());
            }
            last
        };
        if unload {
            if module.is_initialized() {
                module.entry().exit(&module);
            }
            tracing::debug!(module = module.name(), "module unloaded");
        }
        reply_msg(request);
    }

    // Shutdown

    fn abandon(&mut self) {
        let (atom_waiters, loading) = {
            let mut tables = self.shared.tables.lock();
            tables.running = false;
            let loading: Vec<Request> = tables
                .modules
                .values_mut()
                .flat_map(|slot| match std::mem::replace(&mut slot.state, ModuleState::Ready) {
                    ModuleState::Loading(pending) => pending,
                    ModuleState::Ready => Vec::new(),
                })
                .collect();
            (tables.atoms.abandon(), loading)
        };

        let mut failed = 0usize;
        for request in atom_waiters.into_iter().chain(loading) {
            drop_msg(request);
            failed += 1;
        }
        while let Some(msg) = self.task.user_port().get() {
            drop_msg(msg);
            failed += 1;
        }
        for pending in self.initializing.drain(..) {
            tracing::warn!(task = %pending.task.id(), "task still initializing at shutdown");
            drop_msg(pending.request);
            failed += 1;
        }
        for request in self.exiting.drain(..) {
            drop_msg(request);
            failed += 1;
        }
        while self.modreply.get().is_some() {}
        if failed > 0 {
            tracing::warn!(failed, "pending exec requests failed at shutdown");
        }
    }
}

fn start_child(
    task: &Arc<Task>,
    builder: TaskBuilder,
    exec: Arc<TaskSignals>,
    init_done: Arc<AtomicCell<Option<bool>>>,
) -> ExecResult<()> {
    let TaskBuilder { data, init, run, .. } = builder;
    if data.is_some() {
        task.set_data(data);
    }
    task.start(move |task| {
        let ok = match init {
            Some(init) => catch_unwind(AssertUnwindSafe(|| init(&**task))).unwrap_or_else(|_| {
                tracing::error!(task = %task.id(), "task init panicked");
                false
            }),
            None => true,
        };
        if !ok {
            task.set_status(TaskStatus::Failed);
            init_done.store(Some(false));
            exec.signal(SIG_CHILDINIT);
            return;
        }
        task.set_status(TaskStatus::Running);
        init_done.store(Some(true));
        exec.signal(SIG_CHILDINIT);

        let status = match run {
            Some(run) => match catch_unwind(AssertUnwindSafe(|| run(&**task))) {
                Ok(()) => TaskStatus::Finished,
                Err(_) => {
                    tracing::error!(task = %task.id(), "task panicked");
                    TaskStatus::Failed
                }
            },
            None => TaskStatus::Finished,
        };
        task.set_status(status);
        exec.signal(SIG_CHILDEXIT);
    })
}

fn answer_create(mut request: Request, outcome: ExecResult<Arc<Task>>) {
    if let ExecRequest::CreateTask { result, .. } = &mut request.body {
        *result = Some(outcome);
    }
    reply_msg(request);
}

fn answer_lock(mut request: Request, granted: Option<Arc<crate::atom::Atom>>) {
    if let ExecRequest::LockAtom { atom, .. } = &mut request.body {
        *atom = granted;
    }
    reply_msg(request);
}

fn answer_open(mut request: Request, outcome: ExecResult<Arc<Module>>) {
    if let ExecRequest::OpenModule { module, error, .. } = &mut request.body {
        match outcome {
            Ok(opened) => *module = Some(opened),
            Err(err) => *error = Some(err),
        }
    }
    reply_msg(request);
}
