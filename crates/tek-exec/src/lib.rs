//! Tek exec runtime
//!
//! Tasks running on native threads that cooperate through signals and
//! message ports. A privileged exec task serializes task creation and
//! teardown, named atom locking and module reference counting. All memory
//! is handed out by composable memory managers, optionally over pools of
//! puddles.
//!
//! ```no_run
//! use tek_exec::{Exec, ExecConfig, TaskBuilder};
//!
//! let mut exec = Exec::start(ExecConfig::default()).unwrap();
//! let child = exec
//!     .main_task()
//!     .create_task(TaskBuilder::new().name("worker").run(|task| {
//!         tracing::info!(task = %task.id(), "hello from the worker");
//!     }))
//!     .unwrap();
//! exec.main_task().destroy_task(&child).unwrap();
//! exec.shutdown().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod atom;
pub mod config;
pub mod exec;
pub mod io;
pub mod lock;
pub mod memory;
pub mod module;
pub mod pool;
pub mod port;
pub mod signal;
pub mod task;
mod time;

#[cfg(test)]
pub(crate) mod test_utils;

pub use atom::{Atom, AtomMode, AtomTarget};
pub use config::ExecConfig;
pub use exec::Exec;
pub use io::{IoError, IoFlags, IoRequest};
pub use lock::Lock;
pub use memory::{
    create_mem_manager, Backing, MemBlock, MemManager, MemOptions, MemPolicy, MemoryManager,
    MEM_ALIGN,
};
pub use module::{
    Module, ModuleEntry, ModuleFlags, ModuleHandle, ModuleInstance, MODULE_RESERVED_VECTORS,
};
pub use pool::{FixedRegion, Pool, PoolConfig};
pub use port::{ack_msg, drop_msg, reply_msg, Envelope, Message, MsgId, MsgPort, MsgStatus};
pub use task::{current_task, Task, TaskBuilder, TaskId, TaskStatus};

pub use tek_hal::{default_host, HostPrimitives, StdHost};

/// Exec runtime errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// No free signal bit for a port or lock
    #[error("no free signal bits")]
    SignalsExhausted,

    /// A task's init hook reported failure
    #[error("task {0} failed to initialize")]
    TaskInitFailed(String),

    /// A task of that name already exists
    #[error("task name already in use: {0}")]
    TaskNameTaken(String),

    /// A task asked to destroy itself
    #[error("a task cannot destroy itself")]
    DestroySelf,

    /// The exec task is no longer serving requests
    #[error("exec has shut down")]
    ShutDown,

    /// The calling thread is not a task
    #[error("no task bound to the calling thread")]
    NoCurrentTask,

    /// Request not supported in this form
    #[error("unsupported request: {0}")]
    Unsupported(&'static str),

    /// Pool puddles smaller than the large-allocation threshold
    #[error("puddle size {puddle} is below threshold {threshold}")]
    InvalidPool {
        /// Requested puddle size
        puddle: usize,
        /// Requested threshold
        threshold: usize,
    },

    /// A fixed region cannot hold a single allocation
    #[error("region of {0} bytes is too small")]
    RegionTooSmall(usize),

    /// Backing memory could not be obtained
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),

    /// No module of that name is registered
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// The registered module is older than requested
    #[error("module {name} version {have} is older than requested {want}")]
    ModuleVersion {
        /// Module name
        name: String,
        /// Version available
        have: u16,
        /// Version requested
        want: u16,
    },

    /// A vector-table module declares fewer vectors than are reserved
    #[error("module {0} has a short vector table")]
    BadVectorTable(String),

    /// The module's init hook failed
    #[error("module {0} failed to initialize")]
    ModuleInitFailed(String),

    /// The module's open hook refused the opener
    #[error("module {0} refused to open")]
    ModuleOpenFailed(String),

    /// Host primitive failure
    #[error(transparent)]
    Hal(#[from] tek_hal::HalError),
}

/// Result type for exec operations
pub type ExecResult<T> = Result<T, ExecError>;
