//! Human-readable signal names used when formatting verdict diagnostics.
//!
//! The table covers the 32 standard POSIX signals; anything outside that
//! range (or a gap in the table, like the unused slots on some platforms)
//! resolves to `"UNKNOWN"` rather than panicking.

const SIGNAL_NAMES: [&str; 32] = [
    "UNKNOWN", "SIGHUP", "SIGINT", "SIGQUIT", "SIGILL", "SIGTRAP", "SIGABRT", "SIGBUS", "SIGFPE",
    "SIGKILL", "SIGUSR1", "SIGSEGV", "SIGUSR2", "SIGPIPE", "SIGALRM", "SIGTERM", "SIGSTKFLT",
    "SIGCHLD", "SIGCONT", "SIGSTOP", "SIGTSTP", "SIGTTIN", "SIGTTOU", "SIGURG", "SIGXCPU",
    "SIGXFSZ", "SIGVTALRM", "SIGPROF", "SIGWINCH", "SIGIO", "SIGPWR", "SIGSYS",
];

/// Resolve a signal number to its canonical short name (`SIGKILL`, `SIGSEGV`, ...).
///
/// Returns `"UNKNOWN"` for signal numbers outside the standard 0..32 range
/// (real-time signals, or corrupt input) rather than failing.
pub fn signal_name(signal: i32) -> &'static str {
    usize::try_from(signal)
        .ok()
        .and_then(|idx| SIGNAL_NAMES.get(idx))
        .copied()
        .unwrap_or("UNKNOWN")
}
