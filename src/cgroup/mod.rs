//! Cgroup v2 provisioning and telemetry for a single guest lineage.
//!
//! One [`CgroupController`] owns one cgroup directory for the lifetime of a
//! `secure_execute` invocation. Writes are strict (a short write is a setup
//! failure); reads are best-effort, because by the time the supervisor is
//! polling, the cgroup can legitimately disappear out from under it (the
//! guest lineage just finished tearing itself down).

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{SandboxError, SandboxResult};
use crate::limits::SandboxLimits;
use crate::task::Task;

/// `memory.events` counters, sampled as a point-in-time snapshot.
///
/// Fields are cumulative since the cgroup was created, so the supervisor
/// always compares two snapshots (`e - e0`) rather than reading one in
/// isolation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryEvents {
    pub low: u64,
    pub high: u64,
    pub max: u64,
    pub oom: u64,
    pub oom_kill: u64,
    pub oom_group_kill: u64,
}

/// An opened handle on the sandbox's cgroup directory.
///
/// Produced by [`CgroupController::provision`] for atomic attachment via
/// `clone3`'s `CLONE_INTO_CGROUP`. Per the design, this handle is meant to be
/// closed immediately after the `clone3` call returns — the kernel resolves
/// cgroup membership from the fd during the syscall itself and does not need
/// it held open afterwards. Dropping a `CgroupHandle` simply closes the fd.
pub struct CgroupHandle {
    file: File,
}

impl CgroupHandle {
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Owns one sandbox cgroup directory and the host-wide ceilings its
/// `provision` call clamps a [`Task`]'s limits against.
pub struct CgroupController {
    /// Directory the subtree_control write targets (the parent of `cgroup_dir`).
    parent_dir: PathBuf,
    /// The sandbox's own cgroup directory.
    cgroup_dir: PathBuf,
    limits: SandboxLimits,
}

impl CgroupController {
    /// Build a controller for a pre-existing (host-provisioned) cgroup
    /// directory. `cgroup_dir`'s parent must have `memory` and `pids`
    /// available to enable; `cgroup_dir` itself need not exist yet.
    pub fn new(cgroup_dir: impl Into<PathBuf>, limits: SandboxLimits) -> Self {
        let cgroup_dir = cgroup_dir.into();
        let parent_dir = cgroup_dir
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/sys/fs/cgroup"));
        Self {
            parent_dir,
            cgroup_dir,
            limits,
        }
    }

    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    pub fn path(&self) -> &Path {
        &self.cgroup_dir
    }

    /// Validate the mount, enable controllers, write resource limits, and
    /// open the cgroup directory for `clone3` attachment.
    pub fn provision(&self, task: &Task) -> SandboxResult<CgroupHandle> {
        if !self.parent_dir.exists() {
            return Err(SandboxError::CgroupNotMounted);
        }

        write_cgroup_file(
            &self.parent_dir.join("cgroup.subtree_control"),
            "+memory +pids",
        )?;

        if !self.cgroup_dir.exists() {
            fs::create_dir(&self.cgroup_dir).map_err(|source| SandboxError::CgroupWrite {
                path: self.cgroup_dir.display().to_string(),
                source,
            })?;
        }

        let memory_cap = self.limits.clamp_memory(task.max_memory()).to_string();
        write_cgroup_file(&self.cgroup_dir.join("memory.high"), &memory_cap)?;
        write_cgroup_file(&self.cgroup_dir.join("memory.max"), &memory_cap)?;
        write_cgroup_file(&self.cgroup_dir.join("memory.oom.group"), "1")?;

        let pids_cap = self.limits.clamp_processes(task.max_processes()).to_string();
        write_cgroup_file(&self.cgroup_dir.join("pids.max"), &pids_cap)?;

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(&self.cgroup_dir)
            .map_err(|source| SandboxError::CgroupOpen {
                path: self.cgroup_dir.display().to_string(),
                source,
            })?;

        tracing::debug!(path = %self.cgroup_dir.display(), "cgroup provisioned");
        Ok(CgroupHandle { file })
    }

    /// `cpu.stat`'s `usage_usec` field, monotonically non-decreasing within
    /// an invocation. `0` if the file cannot be read.
    pub fn cpu_usage_usec(&self) -> u64 {
        let contents = self.read_best_effort("cpu.stat");
        parse_stat_field(&contents, "usage_usec")
    }

    /// `memory.current`, in bytes. `0` if the file cannot be read.
    pub fn current_memory_bytes(&self) -> u64 {
        parse_u64(&self.read_best_effort("memory.current"))
    }

    /// `memory.peak`, in bytes. `0` if the file cannot be read (older
    /// kernels without `memory.peak` support, or a vanished cgroup).
    pub fn peak_memory_bytes(&self) -> u64 {
        parse_u64(&self.read_best_effort("memory.peak"))
    }

    /// Snapshot of `memory.events`. All-zero if the file cannot be read.
    pub fn memory_events(&self) -> MemoryEvents {
        let contents = self.read_best_effort("memory.events");
        MemoryEvents {
            low: parse_stat_field(&contents, "low"),
            high: parse_stat_field(&contents, "high"),
            max: parse_stat_field(&contents, "max"),
            oom: parse_stat_field(&contents, "oom"),
            oom_kill: parse_stat_field(&contents, "oom_kill"),
            oom_group_kill: parse_stat_field(&contents, "oom_group_kill"),
        }
    }

    /// Deliver `sig` to every process currently listed in `cgroup.procs`, in
    /// reverse order (children before parents, so a parent isn't signalled
    /// into reaping a child that hasn't been signalled yet).
    ///
    /// Best-effort throughout: an unreadable `cgroup.procs` or an
    /// already-dead pid never surfaces as an error, since this is called
    /// both as a targeted kill and as the unconditional final sweep.
    pub fn broadcast_signal(&self, sig: Signal) {
        let contents = self.read_best_effort("cgroup.procs");
        let mut pids: Vec<i32> = contents
            .lines()
            .filter_map(|line| line.trim().parse::<i32>().ok())
            .take(self.limits.pid_cap as usize + 1)
            .collect();
        pids.reverse();

        for pid in pids {
            if let Err(errno) = signal::kill(Pid::from_raw(pid), sig) {
                tracing::debug!(pid, %errno, ?sig, "broadcast_signal: kill failed (pid likely already gone)");
            }
        }
    }

    fn read_best_effort(&self, file_name: &str) -> String {
        let path = self.cgroup_dir.join(file_name);
        let mut contents = String::new();
        match File::open(&path).and_then(|mut f| f.read_to_string(&mut contents)) {
            Ok(_) => contents,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cgroup read failed, treating as zero");
                String::new()
            }
        }
    }
}

fn write_cgroup_file(path: &Path, content: &str) -> SandboxResult<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| SandboxError::CgroupWrite {
            path: path.display().to_string(),
            source,
        })?;
    let bytes = content.as_bytes();
    let wrote = file
        .write(bytes)
        .map_err(|source| SandboxError::CgroupWrite {
            path: path.display().to_string(),
            source,
        })?;
    if wrote != bytes.len() {
        return Err(SandboxError::CgroupShortWrite {
            path: path.display().to_string(),
            wrote,
            expected: bytes.len(),
        });
    }
    Ok(())
}

fn parse_u64(contents: &str) -> u64 {
    contents.trim().parse().unwrap_or(0)
}

/// Parse a `key value` pair out of a `cpu.stat`/`memory.events`-shaped file:
/// one `<name> <number>` pair per line.
fn parse_stat_field(contents: &str, field: &str) -> u64 {
    contents
        .lines()
        .find_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?;
            let value = parts.next()?;
            (name == field).then(|| value.parse().ok()).flatten()
        })
        .unwrap_or(0)
}
