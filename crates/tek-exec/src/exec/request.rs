//! Requests served by the exec and loader tasks

use crate::atom::{Atom, AtomMode, AtomTarget};
use crate::module::Module;
use crate::task::{Task, TaskBuilder, TaskId};
use crate::{ExecError, ExecResult};
use std::fmt;
use std::sync::Arc;

/// A request to the exec task, answered in place
pub(crate) enum ExecRequest {
    /// Create a child task; answered once its init hook has run
    CreateTask {
        builder: Option<TaskBuilder>,
        result: Option<ExecResult<Arc<Task>>>,
    },
    /// Wait for a child task to finish and release it
    DestroyTask { task: Arc<Task> },
    /// Lock an atom; answered when granted or refused
    LockAtom {
        target: AtomTarget,
        mode: AtomMode,
        requester: TaskId,
        atom: Option<Arc<Atom>>,
    },
    /// Release one nesting level of an atom
    UnlockAtom {
        atom: Arc<Atom>,
        mode: AtomMode,
        requester: TaskId,
    },
    /// Open a module, loading it first if needed
    OpenModule {
        name: String,
        version: u16,
        module: Option<Arc<Module>>,
        error: Option<ExecError>,
    },
    /// Drop one reference to a module
    CloseModule { module: Arc<Module> },
}

impl fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecRequest::CreateTask { builder, .. } => f
                .debug_struct("CreateTask")
                .field("name", &builder.as_ref().and_then(|b| b.name.as_deref()))
                .finish(),
            ExecRequest::DestroyTask { task } => {
                f.debug_struct("DestroyTask").field("task", &task.id()).finish()
            }
            ExecRequest::LockAtom { target, mode, .. } => f
                .debug_struct("LockAtom")
                .field("target", target)
                .field("mode", mode)
                .finish(),
            ExecRequest::UnlockAtom { atom, mode, .. } => f
                .debug_struct("UnlockAtom")
                .field("atom", &atom.name())
                .field("mode", mode)
                .finish(),
            ExecRequest::OpenModule { name, version, .. } => f
                .debug_struct("OpenModule")
                .field("name", name)
                .field("version", version)
                .finish(),
            ExecRequest::CloseModule { module } => f
                .debug_struct("CloseModule")
                .field("module", &module.name())
                .finish(),
        }
    }
}

/// Why the loader could not bring a module up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoadFailure {
    /// Fewer vectors than the reserved slots
    BadVectorTable,
    /// Init hook returned false
    InitFailed,
}

impl LoadFailure {
    pub fn into_error(self, name: &str) -> ExecError {
        match self {
            LoadFailure::BadVectorTable => ExecError::BadVectorTable(name.to_string()),
            LoadFailure::InitFailed => ExecError::ModuleInitFailed(name.to_string()),
        }
    }
}

/// Module initialization handed from the exec task to the loader task
pub(crate) struct LoadRequest {
    pub module: Arc<Module>,
    pub failure: Option<LoadFailure>,
}
