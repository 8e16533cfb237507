//! Service configuration
//!
//! Everything an operator can tune lives in [`ServiceConfig`]. The file format
//! is JSON; every section and field is optional and falls back to the defaults
//! below. Durations are expressed in milliseconds.

use crate::config::types::{OptLevel, ResourceLimits, Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub pool: PoolConfig,
    pub limits: LimitPolicy,
    pub timeouts: TimeoutPolicy,
    pub toolchain: ToolchainConfig,
    pub backend: BackendConfig,
}

impl ServiceConfig {
    /// Load a configuration file. Unknown keys are rejected so that typos do
    /// not silently fall back to defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
            .map_err(|e| SandboxError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| SandboxError::Config(e.to_string()))
    }
}

/// Environment pool sizing and lifecycle thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Maximum number of live environments (admission control)
    pub capacity: usize,
    /// An environment is destroyed instead of reset once it served this many requests
    pub max_reuses: u32,
    /// An environment older than this is destroyed instead of reset
    pub max_age_ms: u64,
    /// How long `acquire` waits for capacity before reporting exhaustion
    pub acquire_timeout_ms: u64,
    /// How long `shutdown` waits for in-flight leases before force-destroying
    pub shutdown_grace_ms: u64,
    /// Environments provisioned eagerly at startup
    pub prewarm: usize,
}

impl PoolConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 4,
            max_reuses: 50,
            max_age_ms: 10 * 60 * 1000,
            acquire_timeout_ms: 5_000,
            shutdown_grace_ms: 10_000,
            prewarm: 0,
        }
    }
}

/// Service-wide limit bounds. Requests may override `default` but every
/// field is clamped into `[minimum, maximum]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitPolicy {
    pub maximum: ResourceLimits,
    pub minimum: ResourceLimits,
    pub default: ResourceLimits,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            maximum: ResourceLimits {
                cpu_time_ms: 60_000,
                wall_time_ms: 60_000,
                memory_bytes: 1024 * 1024 * 1024,
                output_bytes: 8 * 1024 * 1024,
                process_count: 64,
                disk_bytes: 512 * 1024 * 1024,
            },
            minimum: ResourceLimits {
                cpu_time_ms: 100,
                wall_time_ms: 100,
                memory_bytes: 8 * 1024 * 1024,
                output_bytes: 1024,
                process_count: 1,
                disk_bytes: 1024 * 1024,
            },
            default: ResourceLimits::default(),
        }
    }
}

/// How the per-request wall budget is split between compiling and running
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case", deny_unknown_fields)]
pub enum SplitPolicy {
    /// Compilation gets a fixed slice on top of the program's wall limit
    Fixed { compile_ms: u64 },
    /// The wall limit covers both stages; `run_reserve_percent` of it is
    /// held back for the program
    Proportional { run_reserve_percent: u8 },
}

impl Default for SplitPolicy {
    fn default() -> Self {
        SplitPolicy::Fixed { compile_ms: 30_000 }
    }
}

/// Wall time budget for one request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StageBudget {
    /// Compile plus run
    pub total: Duration,
    /// Ceiling for the compile stage
    pub compile: Duration,
    /// Slice held back for the run stage
    pub run_reserve: Duration,
}

impl StageBudget {
    /// Time left for the run stage after compiling took `compile_elapsed`,
    /// never more than the program's own wall limit.
    pub fn run_timeout(&self, compile_elapsed: Duration, wall: Duration) -> Duration {
        self.total.saturating_sub(compile_elapsed).min(wall)
    }
}

impl SplitPolicy {
    pub fn budget(&self, wall: Duration) -> StageBudget {
        match *self {
            SplitPolicy::Fixed { compile_ms } => {
                let compile = Duration::from_millis(compile_ms);
                StageBudget {
                    total: compile + wall,
                    compile,
                    run_reserve: wall,
                }
            }
            SplitPolicy::Proportional {
                run_reserve_percent,
            } => {
                let pct = u128::from(run_reserve_percent.min(100));
                let reserve_ms = wall.as_millis() * pct / 100;
                let run_reserve = Duration::from_millis(reserve_ms as u64);
                StageBudget {
                    total: wall,
                    compile: wall.saturating_sub(run_reserve),
                    run_reserve,
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutPolicy {
    pub split: SplitPolicy,
    /// Ceiling for the disassembler, independent of the request budget
    pub disassemble_ms: u64,
}

impl TimeoutPolicy {
    pub fn disassemble(&self) -> Duration {
        Duration::from_millis(self.disassemble_ms)
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            split: SplitPolicy::default(),
            disassemble_ms: 10_000,
        }
    }
}

/// Compiler and disassembler settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolchainConfig {
    pub rustc: PathBuf,
    pub objdump: PathBuf,
    pub edition: String,
    pub opt_level: OptLevel,
    /// Host variables passed through to the compiler (rustup needs these)
    pub preserve_env: Vec<String>,
    /// Memory ceiling applied to the compiler, enforced through the cgroup only
    pub compile_memory_bytes: u64,
    /// Process ceiling applied to the compiler (rustc spawns codegen threads and the linker)
    pub compile_process_count: u32,
    /// Disassembly text beyond this is cut off
    pub disassembly_max_bytes: usize,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            rustc: PathBuf::from("rustc"),
            objdump: PathBuf::from("objdump"),
            edition: "2021".to_string(),
            opt_level: OptLevel::O0,
            preserve_env: vec![
                "RUSTUP_HOME".to_string(),
                "CARGO_HOME".to_string(),
                "RUSTUP_TOOLCHAIN".to_string(),
            ],
            compile_memory_bytes: 4 * 1024 * 1024 * 1024,
            compile_process_count: 256,
            disassembly_max_bytes: 512 * 1024,
        }
    }
}

/// Process backend settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    /// Parent directory of all environment roots
    pub work_root: PathBuf,
    /// Enforce memory/process limits and detect breaches through cgroup v2
    pub use_cgroups: bool,
    pub cgroup_root: PathBuf,
    /// Give compiled programs an empty network namespace
    pub isolate_network: bool,
    /// Run every command in private mount, PID, IPC and UTS namespaces whose
    /// root holds only the context directories and `jail_paths`
    pub isolate_filesystem: bool,
    /// Host paths mounted read-only inside the jail. The toolchain's own
    /// install directories are added at startup.
    pub jail_paths: Vec<PathBuf>,
    /// Identity jailed commands run as when the service runs as root
    pub sandbox_uid: u32,
    pub sandbox_gid: u32,
    /// Refuse to start when an isolation feature is unavailable instead of
    /// degrading with a warning
    pub strict: bool,
    /// Attempts made by `destroy` before reporting a leak
    pub destroy_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            work_root: PathBuf::from("/tmp/boltbox"),
            use_cgroups: true,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/boltbox"),
            isolate_network: true,
            isolate_filesystem: true,
            jail_paths: ["/usr", "/bin", "/sbin", "/lib", "/lib32", "/lib64", "/etc"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            sandbox_uid: 65534,
            sandbox_gid: 65534,
            strict: false,
            destroy_retries: 3,
        }
    }
}
