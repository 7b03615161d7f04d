//! Tek Host Primitives
//!
//! This crate provides the platform layer the exec runtime is built on:
//! - Native threads (spawn/join)
//! - Per-thread signal events keyed by a 32-bit mask
//! - Raw heap allocation with a fixed alignment
//! - A monotonic microsecond clock
//!
//! Mutual exclusion is not wrapped here; the runtime uses `parking_lot`
//! guards directly wherever the host contract calls for a mutex.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod event;
mod host;
mod thread;

pub use event::Event;
pub use host::{default_host, HostPrimitives, StdHost, HOST_ALIGN};
pub use thread::HostThread;

/// Host layer errors
#[derive(Debug, thiserror::Error)]
pub enum HalError {
    /// The platform refused to create a thread
    #[error("Failed to spawn thread '{name}': {source}")]
    ThreadSpawn {
        /// Requested thread name
        name: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// A joined thread terminated by panicking
    #[error("Thread '{0}' panicked")]
    ThreadPanicked(String),
}

/// Host layer result
pub type HalResult<T> = Result<T, HalError>;
