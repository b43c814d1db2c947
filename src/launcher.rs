//! The guest launcher: the code path that runs inside the freshly cloned
//! child, between `clone3` returning and `execve` replacing the image.
//!
//! Everything this module touches between clone and exec must be safe to run
//! in a process that just branched off a potentially multi-threaded parent
//! without running any of its destructors or lock cleanup. The practical
//! consequence: every file that needs opening and every `CString` that needs
//! building happens in [`PreparedExec::prepare`], on the parent side, before
//! `clone3` is ever called. The child-side functions here only issue raw
//! syscalls against already-prepared data — no heap allocation, no
//! `tracing`, no panics.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::sys::ptrace;
use nix::sys::resource::{setrlimit, Resource};
use nix::unistd::{self, Gid, Uid};

use crate::error::{SandboxError, SandboxResult};
use crate::task::Task;

/// Distinct exit codes for each way the guest launcher can fail before
/// `execve`. The supervisor maps these back to a setup-failure verdict
/// whenever it observes an exit with one of these codes on a child that
/// never reached its first trace-stop.
pub mod exit_codes {
    pub const RLIMIT_FAILED: i32 = 101;
    pub const NO_NEW_PRIVS_FAILED: i32 = 102;
    pub const CHDIR_FAILED: i32 = 103;
    pub const REDIRECT_FAILED: i32 = 104;
    pub const SETGID_FAILED: i32 = 105;
    pub const SETUID_FAILED: i32 = 106;
    pub const PRIVILEGE_CHECK_FAILED: i32 = 107;
    pub const PTRACE_FAILED: i32 = 108;
    pub const EXEC_FAILED: i32 = 109;
}

/// The unprivileged identity the guest drops to. `nobody` on most distros.
const GUEST_UID: u32 = 65534;
const GUEST_GID: u32 = 65534;

/// Everything the guest needs to exec, pre-built on the parent side so the
/// cloned child does no allocation of its own.
pub struct PreparedExec {
    exec_path: CString,
    argv: Vec<CString>,
    work_dir: CString,
    stdin_fd: OwnedFd,
    stdout_fd: OwnedFd,
    stderr_fd: OwnedFd,
    max_cpu_time: u64,
    max_file_size: u64,
}

impl PreparedExec {
    /// Open the three I/O redirection targets and build the `CString`s
    /// `execve` needs. Runs on the parent side, before `clone3`.
    pub fn prepare(task: &Task) -> SandboxResult<Self> {
        let to_cstring = |s: &str| {
            CString::new(s).map_err(|_| {
                SandboxError::InvalidTask(format!("path contains a NUL byte: {s}"))
            })
        };

        let exec_path = to_cstring(&task.exec_path().to_string_lossy())?;
        let argv = task
            .args()
            .iter()
            .map(|a| to_cstring(a))
            .collect::<SandboxResult<Vec<_>>>()?;
        let work_dir = to_cstring(&task.work_dir().to_string_lossy())?;

        let stdin_fd: OwnedFd = File::open(task.input_file())
            .map_err(|e| SandboxError::InvalidTask(format!("cannot open input_file: {e}")))?
            .into();
        let stdout_fd: OwnedFd = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(task.output_file())
            .map_err(|e| SandboxError::InvalidTask(format!("cannot open output_file: {e}")))?
            .into();
        let stderr_fd: OwnedFd = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(task.error_file())
            .map_err(|e| SandboxError::InvalidTask(format!("cannot open error_file: {e}")))?
            .into();

        Ok(Self {
            exec_path,
            argv,
            work_dir,
            stdin_fd,
            stdout_fd,
            stderr_fd,
            max_cpu_time: task.max_cpu_time(),
            max_file_size: task.max_file_size(),
        })
    }
}

/// Run the guest launcher sequence inside the cloned child. Never returns:
/// either `execve` replaces the image, or a failure calls `_exit` with a
/// distinct code from [`exit_codes`].
///
/// # Safety
///
/// Must only be called immediately after `clone3` returns its child branch,
/// before any other code runs in this process.
pub unsafe fn run(prepared: &PreparedExec) -> ! {
    let cpu_limit = prepared.max_cpu_time + 1;
    if setrlimit(Resource::RLIMIT_CPU, cpu_limit, cpu_limit).is_err() {
        unsafe { libc::_exit(exit_codes::RLIMIT_FAILED) };
    }
    if setrlimit(
        Resource::RLIMIT_FSIZE,
        prepared.max_file_size,
        prepared.max_file_size,
    )
    .is_err()
    {
        unsafe { libc::_exit(exit_codes::RLIMIT_FAILED) };
    }
    if setrlimit(Resource::RLIMIT_CORE, 0, 0).is_err() {
        unsafe { libc::_exit(exit_codes::RLIMIT_FAILED) };
    }

    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        unsafe { libc::_exit(exit_codes::NO_NEW_PRIVS_FAILED) };
    }

    if unistd::chdir(prepared.work_dir.as_c_str()).is_err() {
        unsafe { libc::_exit(exit_codes::CHDIR_FAILED) };
    }

    if unsafe { libc::dup2(prepared.stdin_fd.as_raw_fd(), libc::STDIN_FILENO) } < 0
        || unsafe { libc::dup2(prepared.stdout_fd.as_raw_fd(), libc::STDOUT_FILENO) } < 0
        || unsafe { libc::dup2(prepared.stderr_fd.as_raw_fd(), libc::STDERR_FILENO) } < 0
    {
        unsafe { libc::_exit(exit_codes::REDIRECT_FAILED) };
    }

    // Group first: dropping uid first would remove the privilege needed to
    // still change gid afterwards.
    if unistd::setgid(Gid::from_raw(GUEST_GID)).is_err() {
        unsafe { libc::_exit(exit_codes::SETGID_FAILED) };
    }
    if unistd::setuid(Uid::from_raw(GUEST_UID)).is_err() {
        unsafe { libc::_exit(exit_codes::SETUID_FAILED) };
    }
    if unistd::getuid().as_raw() != GUEST_UID || unistd::getgid().as_raw() != GUEST_GID {
        unsafe { libc::_exit(exit_codes::PRIVILEGE_CHECK_FAILED) };
    }

    if ptrace::traceme().is_err() {
        unsafe { libc::_exit(exit_codes::PTRACE_FAILED) };
    }

    let argv_ptrs: Vec<*const libc::c_char> = prepared
        .argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();

    unsafe {
        libc::execv(prepared.exec_path.as_ptr(), argv_ptrs.as_ptr());
    }
    unsafe { libc::_exit(exit_codes::EXEC_FAILED) };
}
