//! A minimal `clone3(2)` wrapper.
//!
//! No existing dependency (including `nix`) exposes `clone3` with
//! `CLONE_INTO_CGROUP`, so this talks to the kernel directly via
//! `libc::syscall`. Since the sandbox never needs `CLONE_VM`, the child
//! keeps its own copy of the parent's stack and simply returns from this
//! same function with a `0` pid, exactly like `fork(2)` — no boxed closure
//! or mmap'd stack required.

use std::io;
use std::os::unix::io::RawFd;

use nix::unistd::Pid;

pub mod clone_flags {
    pub const CLONE_NEWPID: u64 = 0x2000_0000;
    pub const CLONE_CLEAR_SIGHAND: u64 = 0x1_0000_0000;
    pub const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;
}

#[cfg(target_arch = "x86_64")]
const SYS_CLONE3: i64 = 435;
#[cfg(target_arch = "aarch64")]
const SYS_CLONE3: i64 = 435;

/// Mirrors the kernel's `struct clone_args`. Field order and widths must
/// match the kernel ABI exactly; this is the `CLONE_ARGS_SIZE_VER2` layout
/// (includes `cgroup`).
#[repr(C)]
#[derive(Debug, Default)]
struct Clone3Args {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Which side of the fork this call returned on.
pub enum Clone3Outcome {
    Parent(Pid),
    Child,
}

/// Create a new process in its own PID namespace, atomically joined to the
/// cgroup identified by `cgroup_fd`, with `SIGCHLD` as its exit signal and a
/// cleared signal-handler table.
///
/// # Safety
///
/// This forks the process. Between the syscall returning `0` in the child
/// and that child calling `exec`, only async-signal-safe operations are
/// sound — see [`crate::launcher`], which is the only caller.
pub unsafe fn clone_into_cgroup(cgroup_fd: RawFd) -> io::Result<Clone3Outcome> {
    let mut args = Clone3Args {
        flags: clone_flags::CLONE_NEWPID
            | clone_flags::CLONE_CLEAR_SIGHAND
            | clone_flags::CLONE_INTO_CGROUP,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: cgroup_fd as u64,
        ..Clone3Args::default()
    };

    let size = std::mem::size_of::<Clone3Args>();
    let ret = unsafe { libc::syscall(SYS_CLONE3, &mut args as *mut Clone3Args, size) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    if ret == 0 {
        Ok(Clone3Outcome::Child)
    } else {
        Ok(Clone3Outcome::Parent(Pid::from_raw(ret as i32)))
    }
}
