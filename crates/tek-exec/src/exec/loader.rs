//! Module loader task
//!
//! Runs module init hooks off the exec task, so a slow init never stalls
//! task creation or atom traffic.

use super::request::{LoadFailure, LoadRequest};
use crate::module::{Module, ModuleFlags, MODULE_RESERVED_VECTORS};
use crate::port::{drop_msg, reply_msg};
use crate::signal::{SIG_ABORT, SIG_USER};
use crate::task::Task;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

pub(crate) fn run(task: &Arc<Task>) {
    tracing::debug!(task = %task.id(), "loader running");
    loop {
        let signals = task.wait(SIG_ABORT | SIG_USER);
        if signals & SIG_ABORT != 0 {
            break;
        }
        while let Some(msg) = task.user_port().get() {
            match msg.downcast::<LoadRequest>() {
                Ok(mut request) => {
                    request.body.failure = load(&request.body.module).err();
                    reply_msg(request);
                }
                Err(msg) => {
                    tracing::warn!(msg = msg.id().as_u64(), "unexpected message on loader port");
                    drop_msg(msg);
                }
            }
        }
    }
    // anything still queued is answered by the exec task's shutdown
    tracing::debug!(task = %task.id(), "loader exiting");
}

fn load(module: &Module) -> Result<(), LoadFailure> {
    let entry = module.entry();
    if module.flags().contains(ModuleFlags::VECTORTABLE)
        && entry.vector_count() < MODULE_RESERVED_VECTORS
    {
        tracing::warn!(
            module = module.name(),
            vectors = entry.vector_count(),
            "module vector table too short"
        );
        return Err(LoadFailure::BadVectorTable);
    }
    match catch_unwind(AssertUnwindSafe(|| entry.init(module))) {
        Ok(true) => {
            module.mark_initialized();
            tracing::debug!(module = module.name(), version = module.version(), "module initialized");
            Ok(())
        }
        Ok(false) => Err(LoadFailure::InitFailed),
        Err(_) => {
            tracing::error!(module = module.name(), "module init panicked");
            Err(LoadFailure::InitFailed)
        }
    }
}
