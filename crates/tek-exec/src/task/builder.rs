//! Task creation options

use super::Task;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Init hook; returning `false` fails the task creation
pub type InitHook = Box<dyn FnOnce(&Task) -> bool + Send>;

/// Body of a task
pub type RunHook = Box<dyn FnOnce(&Task) + Send>;

/// Description of a task to create
///
/// At least one of the init and run hooks must be given. The creator is
/// blocked until the init hook has returned.
#[derive(Default)]
pub struct TaskBuilder {
    pub(crate) name: Option<String>,
    pub(crate) data: Option<Arc<dyn Any + Send + Sync>>,
    pub(crate) init: Option<InitHook>,
    pub(crate) run: Option<RunHook>,
}

impl TaskBuilder {
    /// Empty description
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the task; names are unique among live tasks
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Initial user data
    pub fn data(mut self, data: Arc<dyn Any + Send + Sync>) -> Self {
        self.data = Some(data);
        self
    }

    /// Hook run on the new thread before the creator is answered
    pub fn init(mut self, init: impl FnOnce(&Task) -> bool + Send + 'static) -> Self {
        self.init = Some(Box::new(init));
        self
    }

    /// Hook run on the new thread after a successful init
    pub fn run(mut self, run: impl FnOnce(&Task) + Send + 'static) -> Self {
        self.run = Some(Box::new(run));
        self
    }
}

impl fmt::Debug for TaskBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskBuilder")
            .field("name", &self.name)
            .field("init", &self.init.is_some())
            .field("run", &self.run.is_some())
            .finish()
    }
}
