//! End-to-end coverage of [`judge_sandbox::secure_execute`].
//!
//! These exercise the real cgroup v2 filesystem and `clone3`, so almost all
//! of them are `#[ignore]`d: they need root (to write `cgroup.subtree_control`
//! and to `setuid`/`setgid` down to `nobody`) and a kernel with cgroup v2
//! mounted at `/sys/fs/cgroup`. Run them explicitly with
//! `cargo test -- --ignored` on a suitable host.

use std::fs;
use std::io::Write;

use judge_sandbox::{Sandbox, SandboxLimits, Task};
use tempfile::TempDir;

// ---------------------------------------------------------------------
// fixtures
// ---------------------------------------------------------------------

struct TestContext {
    work_dir: TempDir,
    cgroup_root: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            work_dir: tempfile::tempdir().unwrap(),
            cgroup_root: tempfile::tempdir().unwrap(),
        }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.work_dir.path().join(name)
    }

    fn sandbox(&self) -> Sandbox {
        Sandbox::new(
            self.cgroup_root.path(),
            SandboxLimits {
                hard_memory_cap_bytes: 64 * 1024 * 1024,
                pid_cap: 32,
            },
        )
    }

    fn empty_input(&self) -> std::path::PathBuf {
        let path = self.path("in");
        fs::write(&path, "").unwrap();
        path
    }
}

fn base_task(ctx: &TestContext, exec_path: &str) -> judge_sandbox::TaskBuilder {
    Task::builder(exec_path)
        .work_dir(ctx.work_dir.path())
        .input_file(ctx.empty_input())
        .output_file(ctx.path("out"))
        .error_file(ctx.path("err"))
        .max_cpu_time(2)
        .max_memory(32 * 1024 * 1024)
        .max_file_size(1024 * 1024)
        .max_processes(8)
}

// ---------------------------------------------------------------------
// setup-failure paths: these don't need cgroup v2 or root
// ---------------------------------------------------------------------

#[test]
fn missing_cgroup_mount_is_a_setup_failure_not_a_panic() {
    let ctx = TestContext::new();
    let fake_root = ctx.work_dir.path().join("nonexistent-cgroup-root");
    let sandbox = Sandbox::new(&fake_root, SandboxLimits::default());
    let task = base_task(&ctx, "/bin/true").build().unwrap();

    let result = sandbox.secure_execute(&task);

    assert_eq!(result.status, 0);
    assert_eq!(result.error_msg, "couldn't setup cgroup");
}

#[test]
fn missing_input_file_is_a_setup_failure() {
    let ctx = TestContext::new();
    let sandbox = Sandbox::new(
        ctx.work_dir.path().join("no-such-cgroup-root"),
        SandboxLimits::default(),
    );
    let task = Task::builder("/bin/true")
        .work_dir(ctx.work_dir.path())
        .input_file(ctx.work_dir.path().join("does-not-exist"))
        .output_file(ctx.path("out"))
        .error_file(ctx.path("err"))
        .build()
        .unwrap();

    let result = sandbox.secure_execute(&task);
    assert_eq!(result.status, 0);
}

// ---------------------------------------------------------------------
// real guest runs: cgroup v2 + root required
// ---------------------------------------------------------------------

#[test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
fn clean_exit_reports_none() {
    let ctx = TestContext::new();
    let task = base_task(&ctx, "/bin/true").build().unwrap();

    let result = ctx.sandbox().secure_execute(&task);

    assert_eq!(result.status, 1);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.error_msg, "NONE");
}

#[test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
fn nonzero_exit_reports_nzec() {
    let ctx = TestContext::new();
    let task = base_task(&ctx, "/bin/false").build().unwrap();

    let result = ctx.sandbox().secure_execute(&task);

    assert_eq!(result.status, 1);
    assert_eq!(result.exit_code, 1);
    assert_eq!(result.error_msg, "NZEC");
}

#[test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
fn segfaulting_guest_reports_its_signal_name() {
    let ctx = TestContext::new();
    let task = base_task(&ctx, "/bin/sh")
        .args(vec![
            "sh".to_string(),
            "-c".to_string(),
            "kill -SEGV $$".to_string(),
        ])
        .build()
        .unwrap();

    let result = ctx.sandbox().secure_execute(&task);

    assert_eq!(result.status, 1);
    assert_eq!(result.error_msg, "terminated by signal: SIGSEGV");
}

#[test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
fn busy_loop_past_cpu_time_reports_tle() {
    let ctx = TestContext::new();
    let task = Task::builder("/bin/sh")
        .args(vec![
            "sh".to_string(),
            "-c".to_string(),
            "while true; do :; done".to_string(),
        ])
        .work_dir(ctx.work_dir.path())
        .input_file(ctx.empty_input())
        .output_file(ctx.path("out"))
        .error_file(ctx.path("err"))
        .max_cpu_time(1)
        .max_memory(32 * 1024 * 1024)
        .max_file_size(1024 * 1024)
        .max_processes(8)
        .build()
        .unwrap();

    let result = ctx.sandbox().secure_execute(&task);

    assert_eq!(result.status, 1);
    assert_eq!(result.error_msg, "TLE");
}

#[test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
fn output_past_rlimit_fsize_reports_ole() {
    let ctx = TestContext::new();
    let task = Task::builder("/bin/sh")
        .args(vec![
            "sh".to_string(),
            "-c".to_string(),
            "yes >&1".to_string(),
        ])
        .work_dir(ctx.work_dir.path())
        .input_file(ctx.empty_input())
        .output_file(ctx.path("out"))
        .error_file(ctx.path("err"))
        .max_cpu_time(2)
        .max_memory(32 * 1024 * 1024)
        .max_file_size(4096)
        .max_processes(8)
        .build()
        .unwrap();

    let result = ctx.sandbox().secure_execute(&task);

    assert_eq!(result.status, 1);
    assert_eq!(result.error_msg, "OLE");
}

#[test]
#[ignore = "requires root and a writable cgroup v2 hierarchy"]
fn stdin_is_connected_to_input_file() {
    let ctx = TestContext::new();
    let input_path = ctx.path("in");
    let mut f = fs::File::create(&input_path).unwrap();
    writeln!(f, "hello sandbox").unwrap();

    let task = Task::builder("/bin/cat")
        .work_dir(ctx.work_dir.path())
        .input_file(&input_path)
        .output_file(ctx.path("out"))
        .error_file(ctx.path("err"))
        .max_cpu_time(2)
        .max_memory(32 * 1024 * 1024)
        .max_file_size(1024 * 1024)
        .max_processes(8)
        .build()
        .unwrap();

    let result = ctx.sandbox().secure_execute(&task);

    assert_eq!(result.error_msg, "NONE");
    let output = fs::read_to_string(ctx.path("out")).unwrap();
    assert_eq!(output, "hello sandbox\n");
}
