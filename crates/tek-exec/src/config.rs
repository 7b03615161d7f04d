//! Exec configuration

use crate::module::ModuleEntry;
use std::fmt;
use std::sync::Arc;

/// Options for [`crate::Exec::start`]
#[derive(Clone)]
pub struct ExecConfig {
    /// Name of the exec task (default `"exec"`)
    pub exec_task_name: String,

    /// Name of the module loader task (default `"ramlib"`)
    pub loader_task_name: String,

    /// Name given to the adopted calling thread (default `"main"`)
    pub main_task_name: String,

    /// Modules registered at startup
    pub modules: Vec<Arc<dyn ModuleEntry>>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            exec_task_name: "exec".to_string(),
            loader_task_name: "ramlib".to_string(),
            main_task_name: "main".to_string(),
            modules: Vec::new(),
        }
    }
}

impl ExecConfig {
    /// Register a module at startup
    pub fn with_module(mut self, module: Arc<dyn ModuleEntry>) -> Self {
        self.modules.push(module);
        self
    }

    /// Name the adopted calling thread
    pub fn with_main_task_name(mut self, name: impl Into<String>) -> Self {
        self.main_task_name = name.into();
        self
    }
}

impl fmt::Debug for ExecConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modules: Vec<&str> = self.modules.iter().map(|m| m.name()).collect();
        f.debug_struct("ExecConfig")
            .field("exec_task_name", &self.exec_task_name)
            .field("loader_task_name", &self.loader_task_name)
            .field("main_task_name", &self.main_task_name)
            .field("modules", &modules)
            .finish()
    }
}
