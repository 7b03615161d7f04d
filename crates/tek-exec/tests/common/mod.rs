//! Helpers shared by the integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tek_exec::{Exec, ExecConfig, Task, TaskStatus};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Start a runtime on the calling thread with logging enabled
pub fn start_exec() -> Exec {
    init_test_logging();
    Exec::start(ExecConfig::default()).unwrap()
}

/// Spin until `cond` holds or five seconds pass
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Wait until `task` has left the running state
pub fn wait_finished(task: &Arc<Task>) -> bool {
    wait_until(|| matches!(task.status(), TaskStatus::Finished | TaskStatus::Failed))
}
