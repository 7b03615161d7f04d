//! The exec task
//!
//! One privileged task serializes everything that must be linearized across
//! tasks: creating and destroying tasks, atom lock transitions and module
//! reference counting. Requests arrive as messages on its user port and are
//! answered by replying them. A second system task, the loader, runs module
//! init hooks.

mod dispatcher;
#[allow(clippy::module_inception)]
mod exec;
mod loader;
mod request;

pub use exec::Exec;
pub(crate) use exec::ExecShared;
pub(crate) use request::ExecRequest;
