//! Error types for the sandbox core.
//!
//! Mirrors the split used throughout this crate: fallible setup operations
//! return a [`SandboxError`], while `secure_execute` itself never returns an
//! `Err` — every failure is collapsed into a [`crate::task::TaskResult`] with
//! `status = 0` and a fixed diagnostic string (see [`SandboxError::as_verdict_message`]).

use thiserror::Error;

/// Result type for fallible setup-time operations (cgroup provisioning,
/// task validation). Never used on the `secure_execute` hot path itself.
pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("cgroup v2 is not mounted")]
    CgroupNotMounted,

    #[error("failed to write cgroup control file {path}: {source}")]
    CgroupWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("short write to cgroup control file {path}: wrote {wrote} of {expected} bytes")]
    CgroupShortWrite {
        path: String,
        wrote: usize,
        expected: usize,
    },

    #[error("failed to open cgroup directory {path}: {source}")]
    CgroupOpen {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("clone3 failed: {0}")]
    CloneFailed(#[source] std::io::Error),

    #[error("invalid task: {0}")]
    InvalidTask(String),
}

impl SandboxError {
    /// Collapse a setup-time error into the closed error-message vocabulary
    /// a [`crate::task::TaskResult`] is allowed to carry.
    ///
    /// Every variant here is a cgroup-provisioning failure from the caller's
    /// point of view, so they all map to the same fixed diagnostic; the
    /// variant detail survives only in the `tracing` event logged alongside it.
    pub fn as_setup_verdict_message(&self) -> &'static str {
        match self {
            SandboxError::CgroupNotMounted
            | SandboxError::CgroupWrite { .. }
            | SandboxError::CgroupShortWrite { .. }
            | SandboxError::CgroupOpen { .. } => "couldn't setup cgroup",
            SandboxError::CloneFailed(_) => "couldn't create child process",
            SandboxError::InvalidTask(_) => "couldn't setup cgroup",
        }
    }
}
