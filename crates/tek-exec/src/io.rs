//! Device-style I/O requests
//!
//! An [`IoRequest`] is a message addressed to an opened module. It is
//! started with the module's `begin_io` vector and comes back on the
//! issuing task's sync port, either synchronously (quick I/O) or when the
//! module replies it.

use crate::module::{Module, ModuleInstance};
use crate::port::{reply_msg, Envelope, MsgFlags, MsgId};
use crate::task::Task;
use std::any::Any;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

/// I/O request flags
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct IoFlags(u32);

impl IoFlags {
    /// No flags
    pub const NONE: Self = Self(0);
    /// Complete synchronously if the module can
    pub const QUICK: Self = Self(1);

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Same flags without `other`'s bits
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for IoFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for IoFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoFlags({:#x})", self.0)
    }
}

/// Failure of an I/O request
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    /// The module does not implement the command
    #[error("unknown command")]
    UnknownCommand,
    /// Aborted before completion
    #[error("request aborted")]
    Aborted,
    /// The device could not be opened
    #[error("device open failed")]
    DeviceOpenFailed,
    /// Device-specific error code
    #[error("device error {0}")]
    Device(i32),
}

/// An I/O request body
pub struct IoRequest {
    /// Device command
    pub command: u16,
    /// Request flags
    pub flags: IoFlags,
    /// Outcome, set by the module
    pub error: Option<IoError>,
    /// Bytes or units actually transferred
    pub actual: usize,
    /// Command-specific payload
    pub payload: Option<Box<dyn Any + Send>>,
    module: Option<Arc<Module>>,
}

impl Default for IoRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl IoRequest {
    /// Empty request, not bound to a module
    pub fn new() -> Self {
        Self {
            command: 0,
            flags: IoFlags::NONE,
            error: None,
            actual: 0,
            payload: None,
            module: None,
        }
    }

    /// Set the command
    pub fn with_command(mut self, command: u16) -> Self {
        self.command = command;
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Box<dyn Any + Send>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Module the request is addressed to
    pub fn module(&self) -> Option<&Arc<Module>> {
        self.module.as_ref()
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("command", &self.command)
            .field("flags", &self.flags)
            .field("error", &self.error)
            .field("actual", &self.actual)
            .field("module", &self.module.as_ref().map(|m| m.name()))
            .finish()
    }
}

impl Task {
    /// New request addressed to an opened module, replying to this task's sync port
    pub fn alloc_request(&self, instance: &ModuleInstance) -> Box<Envelope<IoRequest>> {
        let mut request = Envelope::new(IoRequest {
            module: Some(instance.module().clone()),
            ..IoRequest::new()
        });
        request.set_reply_port(Some(self.sync_port().clone()));
        request
    }

    /// Start a request asynchronously; collect it with [`Task::wait_io`]
    pub fn put_io(&self, mut request: Box<Envelope<IoRequest>>) -> MsgId {
        request.body.flags = request.body.flags.without(IoFlags::QUICK);
        let id = request.id();
        if let Some(done) = self.begin_io(request) {
            reply_msg(done);
        }
        id
    }

    /// Perform a request and wait for its completion
    pub fn do_io(&self, mut request: Box<Envelope<IoRequest>>) -> Box<Envelope<IoRequest>> {
        request.body.flags = request.body.flags | IoFlags::QUICK;
        let id = request.id();
        match self.begin_io(request) {
            Some(mut done) => {
                done.flags = MsgFlags::NONE;
                done
            }
            None => self.wait_io(id),
        }
    }

    fn begin_io(&self, mut request: Box<Envelope<IoRequest>>) -> Option<Box<Envelope<IoRequest>>> {
        request.flags = MsgFlags::SENT;
        request.sender = Some(self.id());
        if request.reply_port().is_none() {
            request.set_reply_port(Some(self.sync_port().clone()));
        }
        let Some(module) = request.body.module.clone() else {
            tracing::warn!(msg = request.id().as_u64(), "I/O request without a module");
            request.body.error = Some(IoError::DeviceOpenFailed);
            return Some(request);
        };
        tracing::trace!(module = module.name(), command = request.body.command, "begin io");
        module.entry().begin_io(&module, request)
    }

    /// Block until request `id` is back on the sync port
    pub fn wait_io(&self, id: MsgId) -> Box<Envelope<IoRequest>> {
        self.wait_reply::<IoRequest>(id).1
    }

    /// Whether request `id` has come back
    pub fn check_io(&self, id: MsgId) -> bool {
        self.sync_port().contains(id)
    }

    /// Ask the module to abort request `id`; `false` if it was not pending
    pub fn abort_io(&self, instance: &ModuleInstance, id: MsgId) -> bool {
        let module = instance.module();
        module.entry().abort_io(module, id)
    }
}
