//! Task and TaskResult: the immutable request and the verdict it produces.

use std::path::{Path, PathBuf};

use crate::error::SandboxError;

/// A request to run one untrusted program under the sandbox.
///
/// Immutable after construction. Build one with [`Task::builder`].
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) exec_path: PathBuf,
    pub(crate) args: Vec<String>,
    pub(crate) work_dir: PathBuf,
    pub(crate) input_file: PathBuf,
    pub(crate) output_file: PathBuf,
    pub(crate) error_file: PathBuf,
    pub(crate) max_cpu_time: u64,
    pub(crate) max_memory: u64,
    pub(crate) max_file_size: u64,
    pub(crate) max_processes: u64,
}

impl Task {
    /// Start building a [`Task`] for the given executable.
    pub fn builder(exec_path: impl Into<PathBuf>) -> TaskBuilder {
        TaskBuilder::new(exec_path)
    }

    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn input_file(&self) -> &Path {
        &self.input_file
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    pub fn error_file(&self) -> &Path {
        &self.error_file
    }

    pub fn max_cpu_time(&self) -> u64 {
        self.max_cpu_time
    }

    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    pub fn max_processes(&self) -> u64 {
        self.max_processes
    }
}

/// Builder for [`Task`], validating argv and path shape before construction.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    exec_path: PathBuf,
    args: Vec<String>,
    work_dir: Option<PathBuf>,
    input_file: Option<PathBuf>,
    output_file: Option<PathBuf>,
    error_file: Option<PathBuf>,
    max_cpu_time: u64,
    max_memory: u64,
    max_file_size: u64,
    max_processes: u64,
}

impl TaskBuilder {
    fn new(exec_path: impl Into<PathBuf>) -> Self {
        let exec_path = exec_path.into();
        let argv0 = exec_path
            .to_str()
            .map(str::to_owned)
            .unwrap_or_else(|| exec_path.to_string_lossy().into_owned());
        Self {
            exec_path,
            args: vec![argv0],
            work_dir: None,
            input_file: None,
            output_file: None,
            error_file: None,
            max_cpu_time: 0,
            max_memory: 0,
            max_file_size: 0,
            max_processes: 0,
        }
    }

    /// Replace argv entirely. The first element becomes `argv[0]`.
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(path.into());
        self
    }

    pub fn input_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_file = Some(path.into());
        self
    }

    pub fn output_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn error_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.error_file = Some(path.into());
        self
    }

    pub fn max_cpu_time(mut self, seconds: u64) -> Self {
        self.max_cpu_time = seconds;
        self
    }

    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn max_processes(mut self, count: u64) -> Self {
        self.max_processes = count;
        self
    }

    /// Validate and construct the [`Task`].
    ///
    /// Requires an absolute executable path, a non-empty argv, and all four
    /// I/O paths to be set. Resource limits of `0` are accepted — they are
    /// the caller's problem, not a malformed request.
    pub fn build(self) -> Result<Task, SandboxError> {
        if !self.exec_path.is_absolute() {
            return Err(SandboxError::InvalidTask(format!(
                "exec_path must be absolute, got {}",
                self.exec_path.display()
            )));
        }
        if self.args.is_empty() {
            return Err(SandboxError::InvalidTask("args must be non-empty".into()));
        }
        let work_dir = self
            .work_dir
            .ok_or_else(|| SandboxError::InvalidTask("work_dir is required".into()))?;
        let input_file = self
            .input_file
            .ok_or_else(|| SandboxError::InvalidTask("input_file is required".into()))?;
        let output_file = self
            .output_file
            .ok_or_else(|| SandboxError::InvalidTask("output_file is required".into()))?;
        let error_file = self
            .error_file
            .ok_or_else(|| SandboxError::InvalidTask("error_file is required".into()))?;

        Ok(Task {
            exec_path: self.exec_path,
            args: self.args,
            work_dir,
            input_file,
            output_file,
            error_file,
            max_cpu_time: self.max_cpu_time,
            max_memory: self.max_memory,
            max_file_size: self.max_file_size,
            max_processes: self.max_processes,
        })
    }
}

/// The verdict produced by [`crate::secure_execute`].
///
/// `status == 0` means the sandbox itself failed to set up the run (the
/// guest never meaningfully executed); `status == 1` means the guest ran
/// and either completed or was terminated. See the crate-level docs for the
/// full `error_msg` vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub status: i32,
    pub exit_code: i32,
    pub signal: i32,
    pub exec_time: u64,
    pub memory_used: u64,
    pub error_msg: String,
}

impl TaskResult {
    /// Fresh result in the state `secure_execute` starts from, before any
    /// cgroup or child-process work has happened.
    pub(crate) fn initial() -> Self {
        Self {
            status: 0,
            exit_code: -1,
            signal: -1,
            exec_time: 0,
            memory_used: 0,
            error_msg: String::new(),
        }
    }

    pub(crate) fn setup_failure(message: impl Into<String>) -> Self {
        Self {
            error_msg: message.into(),
            ..Self::initial()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_builder() -> TaskBuilder {
        Task::builder("/bin/true")
            .work_dir("/tmp")
            .input_file("/tmp/in")
            .output_file("/tmp/out")
            .error_file("/tmp/err")
    }

    #[test]
    fn builds_with_all_required_fields() {
        let task = full_builder().max_cpu_time(1).build().unwrap();
        assert_eq!(task.exec_path(), Path::new("/bin/true"));
        assert_eq!(task.args(), &["/bin/true".to_string()]);
        assert_eq!(task.max_cpu_time(), 1);
    }

    #[test]
    fn rejects_relative_exec_path() {
        let err = Task::builder("./a.out")
            .work_dir("/tmp")
            .input_file("/tmp/in")
            .output_file("/tmp/out")
            .error_file("/tmp/err")
            .build()
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidTask(_)));
    }

    #[test]
    fn rejects_empty_argv() {
        let err = full_builder().args(vec![]).build().unwrap_err();
        assert!(matches!(err, SandboxError::InvalidTask(_)));
    }

    #[test]
    fn rejects_missing_io_paths() {
        let err = Task::builder("/bin/true").work_dir("/tmp").build().unwrap_err();
        assert!(matches!(err, SandboxError::InvalidTask(_)));
    }

    #[test]
    fn initial_result_matches_setup_failure_shape() {
        let result = TaskResult::initial();
        assert_eq!(result.status, 0);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.signal, -1);
        assert_eq!(result.error_msg, "");
    }
}
