//! Runtime bootstrap and the state shared with the exec task

use super::dispatcher::Dispatcher;
use super::loader;
use super::request::ExecRequest;
use crate::atom::AtomTable;
use crate::config::ExecConfig;
use crate::memory::{create_mem_manager, Backing, MemManager, MemOptions, MemPolicy};
use crate::module::{Module, ModuleEntry};
use crate::port::{Envelope, MsgPort};
use crate::signal::{SIG_ABORT, SIG_CHILDEXIT, SIG_CHILDINIT};
use crate::task::{current_id, set_current, Task, TaskId, TaskKind, TaskStatus};
use crate::{ExecError, ExecResult};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tek_hal::{default_host, HostPrimitives};

pub(crate) enum ModuleState {
    /// Init running on the loader; openers wait here
    Loading(Vec<Box<Envelope<ExecRequest>>>),
    Ready,
}

pub(crate) struct ModuleSlot {
    pub module: Arc<Module>,
    pub refcount: usize,
    pub state: ModuleState,
}

/// Everything guarded by the process-wide exec lock
pub(crate) struct ExecTables {
    pub running: bool,
    /// Task directory: the main task and running children
    pub tasks: FxHashMap<TaskId, Arc<Task>>,
    pub atoms: AtomTable<Box<Envelope<ExecRequest>>>,
    pub modules: FxHashMap<String, ModuleSlot>,
    pub registry: Vec<Arc<dyn ModuleEntry>>,
}

/// State reachable from every task of one runtime
pub(crate) struct ExecShared {
    pub host: Arc<dyn HostPrimitives>,
    pub tables: Mutex<ExecTables>,
    /// Task-safe manager for runtime-owned allocations such as module bodies
    pub kernel_mm: MemManager,
    msg_mm: MemManager,
    exec_task: OnceCell<Arc<Task>>,
    pub loader_task: OnceCell<Arc<Task>>,
}

impl ExecShared {
    /// Queue a request on the exec task's user port
    pub fn submit(
        &self,
        reply: Option<Arc<MsgPort>>,
        msg: Box<Envelope<ExecRequest>>,
    ) -> ExecResult<()> {
        let tables = self.tables.lock();
        if !tables.running {
            return Err(ExecError::ShutDown);
        }
        let exec = self.exec_task.get().ok_or(ExecError::ShutDown)?;
        exec.user_port().put(reply, msg);
        Ok(())
    }

    pub fn msg_manager(&self) -> &MemManager {
        &self.msg_mm
    }

    pub fn find_task(&self, name: &str) -> Option<Arc<Task>> {
        self.tables
            .lock()
            .tasks
            .values()
            .find(|task| task.name() == Some(name))
            .cloned()
    }

    pub fn add_modules(&self, entries: impl IntoIterator<Item = Arc<dyn ModuleEntry>>) {
        let mut tables = self.tables.lock();
        for entry in entries {
            tables.registry.retain(|known| known.name() != entry.name());
            tracing::debug!(module = entry.name(), version = entry.version(), "module registered");
            tables.registry.push(entry);
        }
    }

    pub fn rem_modules(&self, names: &[&str]) -> usize {
        let mut tables = self.tables.lock();
        let before = tables.registry.len();
        tables.registry.retain(|entry| !names.contains(&entry.name()));
        before - tables.registry.len()
    }

    pub fn scan_modules(&self, prefix: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .tables
            .lock()
            .registry
            .iter()
            .map(|entry| entry.name())
            .filter(|name| name.starts_with(prefix))
            .map(str::to_string)
            .collect();
        names.sort();
        names
    }
}

/// A running exec runtime
///
/// Starting it spawns the exec and loader tasks and adopts the calling
/// thread as the main task. Dropping it shuts the runtime down.
pub struct Exec {
    shared: Arc<ExecShared>,
    main: Arc<Task>,
    previous: Option<Arc<Task>>,
    shut: bool,
}

impl Exec {
    /// Start a runtime on the default host
    pub fn start(config: ExecConfig) -> ExecResult<Self> {
        Self::start_with_host(default_host(), config)
    }

    /// Start a runtime on `host`
    pub fn start_with_host(host: Arc<dyn HostPrimitives>, config: ExecConfig) -> ExecResult<Self> {
        let kernel_mm = create_mem_manager(&host, Backing::Host, MemPolicy::TASK_SAFE, MemOptions::default())?;
        let msg_mm = create_mem_manager(&host, Backing::Host, MemPolicy::MESSAGE, MemOptions::default())?;

        let shared = Arc::new(ExecShared {
            host: host.clone(),
            tables: Mutex::new(ExecTables {
                running: true,
                tasks: FxHashMap::default(),
                atoms: AtomTable::default(),
                modules: FxHashMap::default(),
                registry: config.modules.clone(),
            }),
            kernel_mm,
            msg_mm,
            exec_task: OnceCell::new(),
            loader_task: OnceCell::new(),
        });
        let weak = Arc::downgrade(&shared);

        let exec_task = Task::new(
            Some(config.exec_task_name.clone()),
            TaskKind::System,
            weak.clone(),
            host.clone(),
        );
        exec_task
            .alloc_signal(SIG_CHILDINIT | SIG_CHILDEXIT)
            .ok_or(ExecError::SignalsExhausted)?;
        let modreply = exec_task.create_port()?;

        let loader_task = Task::new(
            Some(config.loader_task_name.clone()),
            TaskKind::System,
            weak.clone(),
            host.clone(),
        );
        loader_task.start(loader::run)?;

        let _ = shared.exec_task.set(exec_task.clone());
        let _ = shared.loader_task.set(loader_task.clone());

        let dispatcher = Dispatcher::new(shared.clone(), exec_task.clone(), modreply);
        if let Err(err) = exec_task.start(move |_| dispatcher.run()) {
            shared.tables.lock().running = false;
            loader_task.signal(SIG_ABORT);
            if let Err(join_err) = loader_task.join() {
                tracing::warn!(%join_err, "loader did not join cleanly");
            }
            return Err(err);
        }

        let main = Task::new(
            Some(config.main_task_name.clone()),
            TaskKind::Main,
            weak,
            host,
        );
        main.set_status(TaskStatus::Running);
        shared.tables.lock().tasks.insert(main.id(), main.clone());
        let previous = set_current(Some(main.clone()));

        tracing::info!(
            exec = %exec_task.id(),
            main = %main.id(),
            modules = config.modules.len(),
            "exec started"
        );
        exec_task.set_status(TaskStatus::Running);
        loader_task.set_status(TaskStatus::Running);

        Ok(Self {
            shared,
            main,
            previous,
            shut: false,
        })
    }

    /// The adopted calling thread
    pub fn main_task(&self) -> &Arc<Task> {
        &self.main
    }

    /// Host primitives the runtime runs on
    pub fn host(&self) -> &Arc<dyn HostPrimitives> {
        &self.shared.host
    }

    /// Manager message payloads are drawn from
    pub fn msg_manager(&self) -> &MemManager {
        self.shared.msg_manager()
    }

    /// Time since the host clock origin
    pub fn system_time(&self) -> Duration {
        Duration::from_micros(self.shared.host.monotonic_micros())
    }

    /// Look up a task in the directory by name
    pub fn find_task(&self, name: &str) -> Option<Arc<Task>> {
        self.shared.find_task(name)
    }

    /// Number of tasks in the directory, including the main task
    pub fn task_count(&self) -> usize {
        self.shared.tables.lock().tasks.len()
    }

    /// Number of named atoms
    pub fn atom_count(&self) -> usize {
        self.shared.tables.lock().atoms.len()
    }

    /// Number of requesters queued on a named atom
    pub fn atom_waiters(&self, name: &str) -> usize {
        self.shared.tables.lock().atoms.waiting(name)
    }

    /// Reference count of a loaded module
    pub fn module_refcount(&self, name: &str) -> Option<usize> {
        self.shared
            .tables
            .lock()
            .modules
            .get(name)
            .map(|slot| slot.refcount)
    }

    /// Stop the exec and loader tasks
    ///
    /// Pending requests fail, and tasks or modules still around are
    /// reported. Later requests from surviving tasks fail with
    /// [`ExecError::ShutDown`].
    pub fn shutdown(&mut self) -> ExecResult<()> {
        if self.shut {
            return Ok(());
        }
        self.shut = true;

        let mut outcome = Ok(());
        let system = [self.shared.exec_task.get(), self.shared.loader_task.get()];
        for task in system.into_iter().flatten() {
            task.signal(SIG_ABORT);
            if let Err(err) = task.join() {
                tracing::error!(%err, task = %task.id(), "system task did not join cleanly");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
            task.set_status(TaskStatus::Finished);
        }

        {
            let mut tables = self.shared.tables.lock();
            tables.running = false;
            let children = tables
                .tasks
                .values()
                .filter(|task| task.kind() == TaskKind::Child)
                .count();
            if children > 0 {
                tracing::warn!(children, "exec shut down with running tasks");
            }
            if !tables.modules.is_empty() {
                tracing::warn!(modules = tables.modules.len(), "exec shut down with open modules");
            }
            tables.tasks.clear();
            tables.modules.clear();
        }
        if let Some(pending) = self.msg_manager().outstanding().filter(|n| *n > 0) {
            tracing::warn!(pending, "messages still allocated at shutdown");
        }

        self.main.set_status(TaskStatus::Finished);
        if current_id() == Some(self.main.id()) {
            set_current(self.previous.take());
        }
        tracing::info!("exec shut down");
        outcome
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exec")
            .field("main", &self.main.id())
            .field("shut", &self.shut)
            .finish()
    }
}

impl Drop for Exec {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            tracing::warn!(%err, "exec shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::current_task;
    use crate::test_utils::init_test_logging;
    use crate::TaskBuilder;

    struct Named(&'static str, u16);

    impl ModuleEntry for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn version(&self) -> u16 {
            self.1
        }
    }

    #[test]
    fn test_start_adopts_main_task() {
        init_test_logging();
        let mut exec = Exec::start(ExecConfig::default()).unwrap();
        assert_eq!(exec.task_count(), 1);
        let main = exec.find_task("main").unwrap();
        assert!(Arc::ptr_eq(&main, exec.main_task()));
        assert_eq!(current_task().unwrap().id(), main.id());
        assert_eq!(main.status(), TaskStatus::Running);
        // system tasks are not in the directory
        assert!(exec.find_task("exec").is_none());

        exec.shutdown().unwrap();
        assert!(current_task().is_err());
        assert_eq!(main.status(), TaskStatus::Finished);
        exec.shutdown().unwrap();
    }

    #[test]
    fn test_requests_fail_after_shutdown() {
        init_test_logging();
        let mut exec = Exec::start(ExecConfig::default()).unwrap();
        let main = exec.main_task().clone();
        exec.shutdown().unwrap();

        assert!(main.lock_atom("late", crate::AtomMode::CREATE).is_none());
        let err = main
            .create_task(TaskBuilder::new().run(|_| {}))
            .unwrap_err();
        assert!(matches!(err, ExecError::ShutDown));
    }

    #[test]
    fn test_module_registry() {
        init_test_logging();
        let exec = Exec::start(
            ExecConfig::default().with_module(Arc::new(Named("gfx.x11", 1))),
        )
        .unwrap();
        let main = exec.main_task();
        main.add_modules([
            Arc::new(Named("gfx.fb", 2)) as Arc<dyn ModuleEntry>,
            Arc::new(Named("io.fs", 1)),
            Arc::new(Named("gfx.x11", 3)),
        ])
        .unwrap();
        assert_eq!(main.scan_modules("gfx.").unwrap(), vec!["gfx.fb", "gfx.x11"]);
        assert_eq!(exec.shared.tables.lock().registry.len(), 3);

        assert_eq!(main.rem_modules(&["gfx.fb", "missing"]).unwrap(), 1);
        assert_eq!(main.scan_modules("").unwrap(), vec!["gfx.x11", "io.fs"]);
    }
}
