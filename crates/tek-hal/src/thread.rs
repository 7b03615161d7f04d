//! Native thread handle

use crate::{HalError, HalResult};
use std::thread::{JoinHandle, ThreadId};

/// Handle to a thread spawned through [`crate::HostPrimitives::spawn_thread`]
#[derive(Debug)]
pub struct HostThread {
    name: String,
    handle: JoinHandle<()>,
}

impl HostThread {
    /// Wrap a std join handle
    pub fn new(name: impl Into<String>, handle: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            handle,
        }
    }

    /// Thread name given at spawn time
    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS-level thread identity
    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread().id()
    }

    /// Whether the thread body has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the thread to exit
    pub fn join(self) -> HalResult<()> {
        self.handle
            .join()
            .map_err(|_| HalError::ThreadPanicked(self.name))
    }
}
