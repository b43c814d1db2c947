//! The supervisor: polls the guest lineage to completion and classifies the
//! verdict.
//!
//! Owns the parent-side half of the ptrace relationship (just enough to
//! notice the first successful `exec`, then detaches) and the polling loop
//! that watches cgroup telemetry alongside `waitpid`.

use std::thread;
use std::time::Duration;

use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::cgroup::{CgroupController, MemoryEvents};
use crate::signals::signal_name;
use crate::task::{Task, TaskResult};

/// How often the poll loop samples cgroup telemetry while the guest runs.
/// The design permits a tight loop with no sleep at all; this is the
/// "short cooperative yield" the design calls out as an acceptable variant.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Where the supervisor is in a single `secure_execute` invocation.
///
/// Transitions are one-directional; a supervisor never returns to an
/// earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Start,
    FailedSetup,
    Ready,
    Running,
    Killing,
    Reaping,
    Classify,
}

impl SupervisorState {
    pub fn can_transition_to(&self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Start, Ready)
                | (Start, FailedSetup)
                | (Ready, Running)
                | (Running, Reaping)
                | (Running, Killing)
                | (Killing, Reaping)
                | (Reaping, Classify)
        )
    }
}

/// Wall-clock/cgroup readings taken at the moment the guest lineage stops
/// being observable (either it exited, or the supervisor killed it).
struct FinalReadings {
    cpu_usage_usec: u64,
    peak_memory_bytes: u64,
    events: MemoryEvents,
}

/// What `waitpid` told us before the guest's first `exec` landed.
enum PreExecOutcome {
    ReachedTraceStop,
    /// The child exited or was killed by a signal before ever calling
    /// `exec` — most commonly one of `launcher::exit_codes`.
    DiedBeforeExec { exit_code: i32, signal: i32 },
    /// The child stopped on some signal other than the `SIGTRAP` exec
    /// trace-stop (e.g. a job-control stop). Left stopped; the caller
    /// is responsible for killing and draining it.
    StoppedBeforeExec(Signal),
}

/// Block until `pid`'s first post-`exec` trace-stop and detach, or report
/// why the child never got there. Pure detection: takes no action beyond
/// ptrace calls, so the distinct cleanup the two failure outcomes need
/// stays in [`supervise`].
fn await_trace_stop(pid: Pid) -> nix::Result<PreExecOutcome> {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WUNTRACED))? {
            WaitStatus::Stopped(stopped_pid, Signal::SIGTRAP) if stopped_pid == pid => {
                ptrace::detach(pid, None)?;
                return Ok(PreExecOutcome::ReachedTraceStop);
            }
            WaitStatus::Stopped(stopped_pid, sig) if stopped_pid == pid => {
                return Ok(PreExecOutcome::StoppedBeforeExec(sig));
            }
            WaitStatus::Exited(_, code) => {
                return Ok(PreExecOutcome::DiedBeforeExec {
                    exit_code: code,
                    signal: -1,
                });
            }
            WaitStatus::Signaled(_, sig, _) => {
                return Ok(PreExecOutcome::DiedBeforeExec {
                    exit_code: -1,
                    signal: sig as i32,
                });
            }
            _ => continue,
        }
    }
}

/// Non-blocking check for whether `pid` has already exited.
fn poll_exit(pid: Pid) -> nix::Result<Option<WaitStatus>> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG))? {
        WaitStatus::StillAlive => Ok(None),
        other => Ok(Some(other)),
    }
}

/// Drain any remaining children of this process (the guest may have left
/// orphans behind in its own PID namespace that get reparented up). Called
/// unconditionally at the end of a run, per the design's "wait(NULL) drain
/// loop until ECHILD" note.
fn drain_remaining_children() {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(nix::Error::ECHILD) => break,
            Err(_) => break,
            Ok(_) => continue,
        }
    }
}

/// Run the RUNNING-state poll loop: sample `cpu_usage_usec`,
/// `current_memory_bytes` and `memory_events` each iteration, tracking a
/// running peak of the memory samples, and kill the cgroup the moment the
/// guest crosses its CPU budget or the kernel records a `memory.max`
/// breach. Returns the terminal wait status, the readings needed to
/// classify it, and whether this loop is the one that killed the guest.
fn poll_until_done(
    pid: Pid,
    task: &Task,
    cgroup: &CgroupController,
    t0: u64,
    e0: &MemoryEvents,
) -> (WaitStatus, FinalReadings, bool) {
    let cpu_limit_usec = task.max_cpu_time().saturating_mul(1_000_000);
    let mut peak_memory_bytes = 0u64;
    let mut killed = false;

    loop {
        let t = cgroup.cpu_usage_usec();
        let m = cgroup.current_memory_bytes();
        let e = cgroup.memory_events();
        peak_memory_bytes = peak_memory_bytes.max(m);

        let over_cpu = cpu_limit_usec != 0 && t.saturating_sub(t0) > cpu_limit_usec;
        let memory_max_breach = e.max > e0.max;

        if !killed && (over_cpu || memory_max_breach) {
            tracing::debug!(
                pid = pid.as_raw(),
                over_cpu,
                memory_max_breach,
                "running_poll: limit exceeded, killing guest lineage"
            );
            cgroup.broadcast_signal(Signal::SIGKILL);
            killed = true;
        }

        if let Ok(Some(status)) = poll_exit(pid) {
            peak_memory_bytes = peak_memory_bytes.max(cgroup.current_memory_bytes());
            let readings = FinalReadings {
                cpu_usage_usec: cgroup.cpu_usage_usec(),
                peak_memory_bytes,
                events: cgroup.memory_events(),
            };
            return (status, readings, killed);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// Turn a terminal [`WaitStatus`] plus cgroup telemetry into the final
/// [`TaskResult`]. MLE/TLE/OLE classification only ever applies when the
/// guest was signalled; a normal exit is always `NONE`/`NZEC` regardless of
/// how much CPU or memory it used on the way there.
fn classify(
    task: &Task,
    status: WaitStatus,
    readings: &FinalReadings,
    t0: u64,
    e0: &MemoryEvents,
) -> TaskResult {
    let exec_time = readings.cpu_usage_usec.saturating_sub(t0) / 1000;
    let memory_used = readings.peak_memory_bytes >> 10;

    let (exit_code, signal, error_msg) = match status {
        WaitStatus::Exited(_, code) => {
            let msg = if code == 0 { "NONE" } else { "NZEC" };
            (code, 0, msg.to_string())
        }
        WaitStatus::Signaled(_, sig, _) => {
            let memory_limit_exceeded = readings.events.max > e0.max
                || readings.events.oom > e0.oom
                || readings.events.oom_kill > e0.oom_kill
                || readings.events.oom_group_kill > e0.oom_group_kill;
            let cpu_limit_exceeded = matches!(sig, Signal::SIGXCPU | Signal::SIGKILL)
                && task.max_cpu_time() > 0
                && readings.cpu_usage_usec.saturating_sub(t0) > task.max_cpu_time() * 1_000_000;

            let msg = if memory_limit_exceeded {
                "MLE".to_string()
            } else if cpu_limit_exceeded {
                "TLE".to_string()
            } else if sig == Signal::SIGXFSZ {
                "OLE".to_string()
            } else {
                format!("terminated by signal: {}", signal_name(sig as i32))
            };
            (-1, sig as i32, msg)
        }
        // Should not normally occur once detached from ptrace; fall back
        // to the closest honest verdict rather than panicking.
        _ => (-1, -1, "NZEC".to_string()),
    };

    TaskResult {
        status: 1,
        exit_code,
        signal,
        exec_time,
        memory_used,
        error_msg,
    }
}

/// Supervise a cloned guest through to a classified [`TaskResult`].
///
/// `pid` must be the direct child returned by `clone3`'s parent branch.
pub fn supervise(task: &Task, cgroup: &CgroupController, pid: Pid) -> TaskResult {
    let mut state = SupervisorState::Start;

    let outcome = tracing::debug_span!("wait_trace_stop").in_scope(|| await_trace_stop(pid));

    match outcome {
        Ok(PreExecOutcome::ReachedTraceStop) => {
            debug_assert!(state.can_transition_to(SupervisorState::Ready));
            state = SupervisorState::Ready;
        }
        Ok(PreExecOutcome::DiedBeforeExec { exit_code, signal }) => {
            debug_assert!(state.can_transition_to(SupervisorState::FailedSetup));
            state = SupervisorState::FailedSetup;
            let _ = state;
            return TaskResult {
                status: 0,
                exit_code,
                signal,
                exec_time: 0,
                memory_used: 0,
                error_msg: "child exited before execv()".to_string(),
            };
        }
        Ok(PreExecOutcome::StoppedBeforeExec(sig)) => {
            debug_assert!(state.can_transition_to(SupervisorState::FailedSetup));
            state = SupervisorState::FailedSetup;
            let _ = state;
            cgroup.broadcast_signal(Signal::SIGKILL);
            drain_remaining_children();
            return TaskResult {
                status: 0,
                exit_code: -1,
                signal: sig as i32,
                exec_time: 0,
                memory_used: 0,
                error_msg: format!(
                    "child terminated before execv() with signal {}",
                    signal_name(sig as i32)
                ),
            };
        }
        Err(e) => {
            tracing::warn!(error = %e, "waitpid failed while awaiting trace-stop");
            return TaskResult::setup_failure("couldn't create child process");
        }
    }

    debug_assert!(state.can_transition_to(SupervisorState::Running));
    state = SupervisorState::Running;

    let t0 = cgroup.cpu_usage_usec();
    let e0 = cgroup.memory_events();

    let (status, readings, killed) =
        tracing::debug_span!("running_poll").in_scope(|| poll_until_done(pid, task, cgroup, t0, &e0));

    if killed {
        debug_assert!(state.can_transition_to(SupervisorState::Killing));
        state = SupervisorState::Killing;
        debug_assert!(state.can_transition_to(SupervisorState::Reaping));
    } else {
        debug_assert!(state.can_transition_to(SupervisorState::Reaping));
    }
    state = SupervisorState::Reaping;

    tracing::debug_span!("reap").in_scope(|| {
        cgroup.broadcast_signal(Signal::SIGKILL);
        drain_remaining_children();
    });

    debug_assert!(state.can_transition_to(SupervisorState::Classify));
    state = SupervisorState::Classify;
    let _ = state;

    tracing::debug_span!("classify").in_scope(|| classify(task, status, &readings, t0, &e0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_task() -> Task {
        Task::builder("/bin/true")
            .work_dir("/tmp")
            .input_file("/tmp/in")
            .output_file("/tmp/out")
            .error_file("/tmp/err")
            .max_cpu_time(1)
            .max_memory(1024 * 1024)
            .build()
            .unwrap()
    }

    fn readings(cpu_usec: u64, peak: u64, events: MemoryEvents) -> FinalReadings {
        FinalReadings {
            cpu_usage_usec: cpu_usec,
            peak_memory_bytes: peak,
            events,
        }
    }

    #[test]
    fn classifies_clean_exit_as_none_with_zero_signal() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Exited(Pid::from_raw(1), 0),
            &readings(1000, 4096 * 1024, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.error_msg, "NONE");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.signal, 0);
    }

    #[test]
    fn classifies_nonzero_exit_as_nzec_with_zero_signal() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Exited(Pid::from_raw(1), 7),
            &readings(1000, 4096 * 1024, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.error_msg, "NZEC");
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.signal, 0);
    }

    #[test]
    fn memory_used_is_converted_bytes_to_kilobytes() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Exited(Pid::from_raw(1), 0),
            &readings(1000, 4096 * 1024, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.memory_used, 4096);
    }

    #[test]
    fn classifies_segv_with_generic_signal_message() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, false),
            &readings(1000, 4096, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.error_msg, "terminated by signal: SIGSEGV");
    }

    #[test]
    fn sigxfsz_becomes_ole_not_a_signal_message() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGXFSZ, false),
            &readings(1000, 4096, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.error_msg, "OLE");
    }

    #[test]
    fn oom_kill_becomes_mle_even_over_a_signal() {
        let task = base_task();
        let e0 = MemoryEvents::default();
        let events = MemoryEvents {
            oom_kill: 1,
            ..MemoryEvents::default()
        };
        let result = classify(
            &task,
            WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false),
            &readings(1000, 4096, events),
            0,
            &e0,
        );
        assert_eq!(result.error_msg, "MLE");
    }

    #[test]
    fn cpu_over_limit_becomes_tle_ahead_of_signal() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false),
            &readings(2_000_000, 4096, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.error_msg, "TLE");
    }

    #[test]
    fn cpu_over_limit_is_not_tle_without_sigxcpu_or_sigkill() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, false),
            &readings(2_000_000, 4096, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.error_msg, "terminated by signal: SIGSEGV");
    }

    #[test]
    fn mle_outranks_tle_when_both_apply() {
        let task = base_task();
        let e0 = MemoryEvents::default();
        let events = MemoryEvents {
            max: 1,
            ..MemoryEvents::default()
        };
        let result = classify(
            &task,
            WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false),
            &readings(2_000_000, 4096, events),
            0,
            &e0,
        );
        assert_eq!(result.error_msg, "MLE");
    }

    #[test]
    fn normal_exit_is_never_reclassified_as_tle_even_past_the_cpu_budget() {
        let task = base_task();
        let result = classify(
            &task,
            WaitStatus::Exited(Pid::from_raw(1), 0),
            &readings(5_000_000, 4096, MemoryEvents::default()),
            0,
            &MemoryEvents::default(),
        );
        assert_eq!(result.error_msg, "NONE");
    }

    #[test]
    fn state_machine_forbids_skipping_trace_stop() {
        assert!(!SupervisorState::Start.can_transition_to(SupervisorState::Running));
        assert!(SupervisorState::Start.can_transition_to(SupervisorState::Ready));
    }

    #[test]
    fn state_machine_allows_direct_setup_failure_only_from_start() {
        assert!(SupervisorState::Start.can_transition_to(SupervisorState::FailedSetup));
        assert!(!SupervisorState::Ready.can_transition_to(SupervisorState::FailedSetup));
    }

    #[test]
    fn state_machine_requires_reaping_before_classify() {
        assert!(!SupervisorState::Running.can_transition_to(SupervisorState::Classify));
        assert!(SupervisorState::Reaping.can_transition_to(SupervisorState::Classify));
    }
}
