//! Sandbox entry point: ties cgroup provisioning, `clone3`, the guest
//! launcher and the supervisor together into one infallible call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::cgroup::CgroupController;
use crate::clone3::{self, Clone3Outcome};
use crate::launcher::{self, PreparedExec};
use crate::limits::SandboxLimits;
use crate::supervisor;
use crate::task::{Task, TaskResult};

/// Default parent directory new per-task cgroups are created under.
const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/judge";

static SLOT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A configured sandbox: a cgroup root directory plus the host ceilings any
/// [`Task`] run through it gets clamped to.
///
/// Distinct from [`Task`] the way the design separates per-run requests
/// from host-wide configuration: one `Sandbox` is built once and reused
/// across many `secure_execute` calls.
#[derive(Debug, Clone)]
pub struct Sandbox {
    cgroup_root: PathBuf,
    limits: SandboxLimits,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            limits: SandboxLimits::default(),
        }
    }
}

impl Sandbox {
    pub fn new(cgroup_root: impl Into<PathBuf>, limits: SandboxLimits) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            limits,
        }
    }

    /// Run `task` to completion inside a fresh, single-use cgroup.
    ///
    /// Never returns an `Err`: every setup failure (unmounted cgroupfs, a
    /// short write, a failed `clone3`) is collapsed into a `TaskResult` with
    /// `status = 0` and a fixed diagnostic string.
    pub fn secure_execute(&self, task: &Task) -> TaskResult {
        let span = tracing::info_span!("secure_execute", exec = %task.exec_path().display());
        let _entered = span.enter();

        let slot = SLOT_COUNTER.fetch_add(1, Ordering::Relaxed);
        let cgroup_dir = self
            .cgroup_root
            .join(format!("slot-{}-{}", std::process::id(), slot));
        let cgroup = CgroupController::new(&cgroup_dir, self.limits);

        let handle = match tracing::debug_span!("provision").in_scope(|| cgroup.provision(task)) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(error = %e, "cgroup provisioning failed");
                return TaskResult::setup_failure(e.as_setup_verdict_message());
            }
        };

        let prepared = match PreparedExec::prepare(task) {
            Ok(prepared) => prepared,
            Err(e) => {
                tracing::warn!(error = %e, "guest launcher preparation failed");
                cleanup_cgroup_dir(&cgroup_dir);
                return TaskResult::setup_failure("couldn't create child process");
            }
        };

        // SAFETY: `clone3` is called with no other threads of this process
        // expected to run concurrently with the fork in the child branch;
        // the child branch below only calls `launcher::run`, which is
        // documented as safe to call in exactly this position.
        let outcome = unsafe { clone3::clone_into_cgroup(handle.as_raw_fd()) };
        drop(handle);

        let pid = match outcome {
            Ok(Clone3Outcome::Parent(pid)) => pid,
            Ok(Clone3Outcome::Child) => {
                // SAFETY: we are the freshly cloned child; `run` never
                // returns.
                unsafe { launcher::run(&prepared) };
            }
            Err(e) => {
                tracing::warn!(error = %e, "clone3 failed");
                cleanup_cgroup_dir(&cgroup_dir);
                return TaskResult::setup_failure("couldn't create child process");
            }
        };

        let result = supervisor::supervise(task, &cgroup, pid);
        reap_stray(pid);
        cleanup_cgroup_dir(&cgroup_dir);
        result
    }
}

/// Best-effort final reap in case the supervisor's own wait loop missed the
/// terminal status (e.g. it was already consumed by the kill-path wait).
fn reap_stray(pid: Pid) {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) | Err(_) => {}
        Ok(_) => {}
    }
}

fn cleanup_cgroup_dir(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir(path) {
        tracing::debug!(path = %path.display(), error = %e, "cgroup directory cleanup failed (non-fatal)");
    }
}

/// Run `task` to completion using the default sandbox configuration (cgroup
/// root `/sys/fs/cgroup/judge`, default host ceilings).
///
/// Prefer constructing a [`Sandbox`] directly when embedding this crate in a
/// judge that needs a non-default cgroup root or host ceilings.
pub fn secure_execute(task: &Task) -> TaskResult {
    Sandbox::default().secure_execute(task)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sandbox_uses_expected_cgroup_root() {
        let sandbox = Sandbox::default();
        assert_eq!(sandbox.cgroup_root, PathBuf::from(DEFAULT_CGROUP_ROOT));
    }

    #[test]
    fn custom_sandbox_keeps_its_own_root_and_limits() {
        let limits = SandboxLimits {
            hard_memory_cap_bytes: 1024,
            pid_cap: 1,
        };
        let sandbox = Sandbox::new("/tmp/custom-judge", limits);
        assert_eq!(sandbox.cgroup_root, PathBuf::from("/tmp/custom-judge"));
        assert_eq!(sandbox.limits.pid_cap, 1);
    }
}
