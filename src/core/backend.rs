//! Isolation backend abstraction.
//!
//! The backend is the hard trust boundary: it creates contexts (a filesystem
//! root plus a process/resource container), runs commands inside them and
//! tears them down. Every call is fallible and every capture is bounded.

use crate::config::types::{CapturedOutput, LimitBreach, ResourceLimits, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Subdirectory holding sources
pub const WORK_DIR: &str = "work";
/// Subdirectory holding build artifacts
pub const OUT_DIR: &str = "out";
/// Scratch directory exposed as `TMPDIR`/`HOME`
pub const TEMP_DIR: &str = "tmp";

/// Backend-side identity of one provisioned context
#[derive(Clone, Debug)]
pub struct ContextHandle {
    pub id: String,
    /// Filesystem root owned by the context
    pub root: PathBuf,
    /// cgroup directory when the backend uses one
    pub cgroup: Option<PathBuf>,
}

impl ContextHandle {
    pub fn new(id: impl Into<String>, root: PathBuf) -> Self {
        Self {
            id: id.into(),
            root,
            cgroup: None,
        }
    }

    pub fn workspace(&self) -> RunWorkspace {
        RunWorkspace {
            root: self.root.clone(),
            workdir: self.root.join(WORK_DIR),
            out_dir: self.root.join(OUT_DIR),
            temp_dir: self.root.join(TEMP_DIR),
        }
    }
}

/// Well-known directories inside a context root
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunWorkspace {
    pub root: PathBuf,
    pub workdir: PathBuf,
    pub out_dir: PathBuf,
    pub temp_dir: PathBuf,
}

/// Kernel-level limits applied to one command
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLimits {
    pub cpu_time: Duration,
    pub memory_bytes: u64,
    /// Also cap the address space with `RLIMIT_AS`. Off for the compiler,
    /// whose virtual reservations far exceed its resident use.
    pub enforce_address_space: bool,
    pub process_count: u32,
    pub output_bytes: u64,
    pub file_size_bytes: u64,
}

impl CommandLimits {
    pub fn from_limits(limits: &ResourceLimits) -> Self {
        Self {
            cpu_time: limits.cpu_time(),
            memory_bytes: limits.memory_bytes,
            enforce_address_space: true,
            process_count: limits.process_count,
            output_bytes: limits.output_bytes,
            file_size_bytes: limits.disk_bytes,
        }
    }
}

/// One command to run inside a context
#[derive(Clone, Debug)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
    pub limits: CommandLimits,
    /// Extra variables on top of the backend's minimal environment
    pub env: Vec<(String, String)>,
    /// Working directory; must lie inside the context root
    pub workdir: PathBuf,
    pub isolate_network: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>, workdir: PathBuf, limits: CommandLimits) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(10),
            limits,
            env: Vec::new(),
            workdir,
            isolate_network: false,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, data: Option<Vec<u8>>) -> Self {
        self.stdin = data;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn isolate_network(mut self, isolate: bool) -> Self {
        self.isolate_network = isolate;
        self
    }

    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// What the backend observed while running one command
#[derive(Clone, Debug, Default)]
pub struct RawRun {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    /// The wall timeout fired and the process tree was killed
    pub timed_out: bool,
    /// A resource limit killed the process
    pub breach: Option<LimitBreach>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub elapsed: Duration,
    pub memory_peak: Option<u64>,
    pub cpu_time: Option<Duration>,
    /// Processes of the command survived its exit
    pub stray_processes: bool,
}

impl RawRun {
    /// A normal exit with the given code and stdout
    pub fn exited(code: i32, stdout: &[u8]) -> Self {
        Self {
            exit_code: Some(code),
            stdout: CapturedOutput::from_bytes(stdout.to_vec()),
            ..Default::default()
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            signal: Some(signal),
            ..Default::default()
        }
    }

    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            signal: Some(libc::SIGKILL),
            timed_out: true,
            elapsed,
            ..Default::default()
        }
    }

    pub fn breached(breach: LimitBreach) -> Self {
        Self {
            signal: Some(libc::SIGKILL),
            breach: Some(breach),
            ..Default::default()
        }
    }

    pub fn with_stderr(mut self, stderr: &[u8]) -> Self {
        self.stderr = CapturedOutput::from_bytes(stderr.to_vec());
        self
    }
}

/// Context lifecycle operations of an isolation mechanism
pub trait IsolationBackend: Send + Sync {
    fn backend_name(&self) -> &str;

    /// Allocate a filesystem root and process container sized for `ceiling`
    fn create_context(&self, id: &str, ceiling: &ResourceLimits) -> Result<ContextHandle>;

    /// Run one command to completion, timeout or limit breach
    fn run_in_context(&self, ctx: &ContextHandle, command: &CommandSpec) -> Result<RawRun>;

    /// Return the context to its freshly created state or fail with
    /// `ResetUnsupported`
    fn reset_context(&self, ctx: &ContextHandle) -> Result<()>;

    /// Release everything the context holds; calling it twice is harmless
    fn destroy_context(&self, ctx: &ContextHandle) -> Result<()>;

    /// Cheap liveness probe run before handing out a reused context
    fn health_check(&self, ctx: &ContextHandle) -> Result<()> {
        if ctx.root.join(WORK_DIR).is_dir() {
            Ok(())
        } else {
            Err(SandboxError::Infrastructure(format!(
                "context {} lost its workspace at {}",
                ctx.id,
                ctx.root.display()
            )))
        }
    }
}
