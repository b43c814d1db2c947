//! Sandboxed execution core for running a single untrusted native program
//! under Linux cgroup v2, with `clone3`-based process isolation and
//! ptrace-observed exec detection.
//!
//! The entry point is [`secure_execute`] (or [`Sandbox::secure_execute`] for
//! a non-default cgroup root / host ceilings). It is infallible: every
//! failure, whether in cgroup setup or in the guest's own execution, comes
//! back as a [`TaskResult`] rather than an `Err`.

mod cgroup;
mod clone3;
mod entry;
mod error;
mod launcher;
mod limits;
mod signals;
mod supervisor;
mod task;

pub use cgroup::{CgroupController, CgroupHandle, MemoryEvents};
pub use entry::{secure_execute, Sandbox};
pub use error::{SandboxError, SandboxResult};
pub use limits::{SandboxLimits, DEFAULT_HARD_MEMORY_CAP_BYTES, DEFAULT_PID_CAP};
pub use task::{Task, TaskBuilder, TaskResult};

use std::sync::OnceLock;

static LOGGING_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// Logs to `<log_dir>/<file_prefix>.<date>` with daily rotation on a
/// non-blocking writer, and honors `RUST_LOG` if set. Safe to call more
/// than once; only the first call takes effect.
pub fn init_logging(log_dir: impl AsRef<std::path::Path>, file_prefix: &str) {
    LOGGING_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .init();

        guard
    });
}
