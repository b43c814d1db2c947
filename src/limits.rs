//! Host-wide ceilings the [`crate::cgroup::CgroupController`] silently clamps to.
//!
//! These replace the compile-time constants the design notes call out as an
//! open question: rather than baking `HARD_CAP`/`PID_CAP` into the binary,
//! they are constructor parameters so an embedding judge (or a test) can
//! override the host defaults without touching source.

/// Ceilings a [`Task`](crate::task::Task)'s own limits are clamped against.
///
/// Clamping is silent: a `Task` asking for more than the ceiling never fails
/// to set up, it's simply held to the ceiling instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Upper bound on `memory.high`/`memory.max`, in bytes.
    pub hard_memory_cap_bytes: u64,
    /// Upper bound on `pids.max`.
    pub pid_cap: u64,
}

/// 512 MiB — a reasonable per-guest ceiling for a judge host running many
/// submissions concurrently.
pub const DEFAULT_HARD_MEMORY_CAP_BYTES: u64 = 512 * 1024 * 1024;

/// Generous enough for fork-bomb-shaped submissions to still observe a
/// failure rather than crash the supervisor's own bookkeeping.
pub const DEFAULT_PID_CAP: u64 = 2048;

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            hard_memory_cap_bytes: DEFAULT_HARD_MEMORY_CAP_BYTES,
            pid_cap: DEFAULT_PID_CAP,
        }
    }
}

impl SandboxLimits {
    pub fn clamp_memory(&self, requested: u64) -> u64 {
        requested.min(self.hard_memory_cap_bytes)
    }

    pub fn clamp_processes(&self, requested: u64) -> u64 {
        requested.min(self.pid_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_configured_ceiling_not_default() {
        let limits = SandboxLimits {
            hard_memory_cap_bytes: 1024,
            pid_cap: 4,
        };
        assert_eq!(limits.clamp_memory(1_000_000), 1024);
        assert_eq!(limits.clamp_processes(100), 4);
    }

    #[test]
    fn never_raises_a_lax_request() {
        let limits = SandboxLimits::default();
        assert_eq!(limits.clamp_memory(1024), 1024);
        assert_eq!(limits.clamp_processes(4), 4);
    }
}
