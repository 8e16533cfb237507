/// Core types and structures for the boltbox service
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// What the caller wants done with the submitted source
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionMode {
    /// Compile and report diagnostics only
    CompileOnly,
    /// Compile, then run the produced binary
    #[default]
    CompileAndRun,
    /// Compile, run, then disassemble the produced binary
    CompileAndDisassemble,
}

impl ExecutionMode {
    pub fn runs_program(self) -> bool {
        !matches!(self, ExecutionMode::CompileOnly)
    }

    pub fn disassembles(self) -> bool {
        matches!(self, ExecutionMode::CompileAndDisassemble)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::CompileOnly => "compile-only",
            ExecutionMode::CompileAndRun => "compile-and-run",
            ExecutionMode::CompileAndDisassemble => "compile-and-disassemble",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "compile-only" => Ok(ExecutionMode::CompileOnly),
            "compile-and-run" | "run" => Ok(ExecutionMode::CompileAndRun),
            "compile-and-disassemble" | "disassemble" => Ok(ExecutionMode::CompileAndDisassemble),
            other => Err(SandboxError::InvalidRequest(format!(
                "unrecognized execution mode: {other}"
            ))),
        }
    }
}

/// Compiler optimization level (`-C opt-level=`)
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum OptLevel {
    #[default]
    #[serde(rename = "0")]
    O0,
    #[serde(rename = "1")]
    O1,
    #[serde(rename = "2")]
    O2,
    #[serde(rename = "3")]
    O3,
    #[serde(rename = "s")]
    Size,
    #[serde(rename = "z")]
    MinSize,
}

impl OptLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            OptLevel::O0 => "0",
            OptLevel::O1 => "1",
            OptLevel::O2 => "2",
            OptLevel::O3 => "3",
            OptLevel::Size => "s",
            OptLevel::MinSize => "z",
        }
    }
}

impl FromStr for OptLevel {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0" => Ok(OptLevel::O0),
            "1" => Ok(OptLevel::O1),
            "2" => Ok(OptLevel::O2),
            "3" => Ok(OptLevel::O3),
            "s" => Ok(OptLevel::Size),
            "z" => Ok(OptLevel::MinSize),
            other => Err(SandboxError::InvalidRequest(format!(
                "unrecognized opt level: {other} (expected 0-3, s or z)"
            ))),
        }
    }
}

/// Resource ceilings for one execution attempt.
///
/// Times are kept in milliseconds so the struct serializes the same way in
/// configuration files and results.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    /// CPU time ceiling (milliseconds)
    pub cpu_time_ms: u64,
    /// Wall clock ceiling (milliseconds)
    pub wall_time_ms: u64,
    /// Memory ceiling (bytes)
    pub memory_bytes: u64,
    /// Per-stream captured output ceiling (bytes)
    pub output_bytes: u64,
    /// Maximum live processes/threads
    pub process_count: u32,
    /// Disk quota for the environment root (bytes)
    pub disk_bytes: u64,
}

impl ResourceLimits {
    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    /// True when every ceiling here is at least as large as the one in `other`.
    pub fn satisfies(&self, other: &ResourceLimits) -> bool {
        self.cpu_time_ms >= other.cpu_time_ms
            && self.wall_time_ms >= other.wall_time_ms
            && self.memory_bytes >= other.memory_bytes
            && self.output_bytes >= other.output_bytes
            && self.process_count >= other.process_count
            && self.disk_bytes >= other.disk_bytes
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_ms: 10_000,
            wall_time_ms: 10_000,
            memory_bytes: 256 * 1024 * 1024,
            output_bytes: 1024 * 1024,
            process_count: 16,
            disk_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Partially specified per-request limits. Missing fields fall back to the
/// service defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LimitOverrides {
    pub cpu_time_ms: Option<u64>,
    pub wall_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub output_bytes: Option<u64>,
    pub process_count: Option<u32>,
    pub disk_bytes: Option<u64>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        *self == LimitOverrides::default()
    }
}

/// Auxiliary source file placed next to the main source (e.g. a sibling module)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the source directory
    pub path: String,
    pub content: String,
}

/// One code execution request. Immutable once accepted by the dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ExecutionRequest {
    pub source: String,
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub stdin: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub limits: LimitOverrides,
    #[serde(default)]
    pub opt_level: Option<OptLevel>,
    #[serde(default)]
    pub compiler_args: Vec<String>,
    #[serde(default)]
    pub extra_files: Vec<SourceFile>,
}

impl ExecutionRequest {
    pub fn new(source: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            source: source.into(),
            mode,
            stdin: None,
            arguments: Vec::new(),
            limits: LimitOverrides::default(),
            opt_level: None,
            compiler_args: Vec::new(),
            extra_files: Vec::new(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }

    /// SHA-256 of the submitted source, used to correlate audit events
    /// without logging the source itself.
    pub fn source_digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        for file in &self.extra_files {
            hasher.update(file.path.as_bytes());
            hasher.update(file.content.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Terminal outcome of one request
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InfrastructureError,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::CompileError => "compile-error",
            Outcome::RuntimeError => "runtime-error",
            Outcome::Timeout => "timeout",
            Outcome::ResourceExceeded => "resource-exceeded",
            Outcome::InfrastructureError => "infrastructure-error",
        }
    }

    /// Outcomes after which the environment must never be reused.
    pub fn contaminates(self) -> bool {
        matches!(
            self,
            Outcome::Timeout | Outcome::ResourceExceeded | Outcome::InfrastructureError
        )
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which service-side failure produced an `infrastructure-error` result
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// No environment became available before the acquisition timeout
    PoolExhausted,
    /// The pool is shutting down and accepts no new work
    PoolShutdown,
    /// A fresh environment could not be provisioned
    Provisioning,
    /// The isolation backend failed while the request was in flight
    Infrastructure,
}

/// Which limit a killed program ran into
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LimitBreach {
    Memory,
    CpuTime,
    Processes,
    Disk,
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitBreach::Memory => write!(f, "memory"),
            LimitBreach::CpuTime => write!(f, "cpu_time"),
            LimitBreach::Processes => write!(f, "processes"),
            LimitBreach::Disk => write!(f, "disk"),
        }
    }
}

/// Diagnostic severity
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Error,
    Warning,
    Note,
    Help,
}

/// Position of a diagnostic in the submitted sources
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub line_end: u32,
    pub column_end: u32,
}

/// One compiler-reported message
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered: Option<String>,
}

impl Diagnostic {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            code: None,
            location: None,
            children: Vec::new(),
            rendered: None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Size-capped capture of one output stream
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedOutput {
    #[serde(serialize_with = "bytes_as_text", deserialize_with = "text_as_bytes")]
    pub data: Vec<u8>,
    /// Set when the stream produced more than the cap
    pub truncated: bool,
    /// Bytes the stream produced in total, including discarded ones
    pub total_bytes: u64,
}

impl CapturedOutput {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let total_bytes = data.len() as u64;
        Self {
            data,
            truncated: false,
            total_bytes,
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn bytes_as_text<S: Serializer>(data: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

fn text_as_bytes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
    String::deserialize(deserializer).map(String::into_bytes)
}

/// Per-stage wall time accounting
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTimings {
    pub acquire_ms: u64,
    pub compile_ms: u64,
    pub run_ms: u64,
    pub disassemble_ms: u64,
}

/// Structured result of one execution request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub request_id: String,
    pub outcome: Outcome,
    /// Compiler diagnostics in emission order
    pub diagnostics: Vec<Diagnostic>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Exit code of the program; absent on compile failure or timeout
    pub exit_code: Option<i32>,
    /// Signal that terminated the program, if any
    pub signal: Option<i32>,
    /// Limit that was breached for `resource-exceeded`
    pub limit_breached: Option<LimitBreach>,
    pub elapsed_ms: u64,
    pub timings: StageTimings,
    pub disassembly: Option<String>,
    pub disassembly_truncated: bool,
    /// Service-side failure kind for `infrastructure-error`
    pub failure: Option<FailureKind>,
    /// Whether retrying the same request later may succeed
    pub retry_hint: bool,
    pub message: Option<String>,
    pub environment_id: Option<String>,
    pub limits: Option<ResourceLimits>,
}

impl ExecutionResult {
    pub fn new(request_id: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            request_id: request_id.into(),
            outcome,
            diagnostics: Vec::new(),
            stdout: CapturedOutput::default(),
            stderr: CapturedOutput::default(),
            exit_code: None,
            signal: None,
            limit_breached: None,
            elapsed_ms: 0,
            timings: StageTimings::default(),
            disassembly: None,
            disassembly_truncated: false,
            failure: None,
            retry_hint: false,
            message: None,
            environment_id: None,
            limits: None,
        }
    }

    /// Result for a request the service could not serve.
    pub fn infrastructure(request_id: impl Into<String>, failure: FailureKind, message: String) -> Self {
        let mut result = Self::new(request_id, Outcome::InfrastructureError);
        result.retry_hint = !matches!(failure, FailureKind::PoolShutdown);
        result.failure = Some(failure);
        result.message = Some(message);
        result
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

/// Error taxonomy for boltbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid limits: {0}")]
    InvalidLimits(String),

    #[error("Provisioning error: {0}")]
    Provisioning(String),

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Reset unsupported: {0}")]
    ResetUnsupported(String),

    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    #[error("Environment pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("Environment pool is shutting down")]
    PoolShutdown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Stable kebab-case name of the error kind for wire responses
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::InvalidRequest(_) => "invalid-request",
            SandboxError::InvalidLimits(_) => "invalid-limits",
            SandboxError::Provisioning(_) => "provisioning",
            SandboxError::Filesystem(_) => "filesystem",
            SandboxError::ResetUnsupported(_) => "reset-unsupported",
            SandboxError::Infrastructure(_) => "infrastructure",
            SandboxError::PoolExhausted { .. } => "pool-exhausted",
            SandboxError::PoolShutdown => "pool-shutdown",
            SandboxError::Config(_) => "config",
            SandboxError::Io(_) => "io",
        }
    }

    /// Errors caused by the caller rather than the service
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            SandboxError::InvalidRequest(_) | SandboxError::InvalidLimits(_)
        )
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Infrastructure(err.to_string())
    }
}

/// Result type alias for boltbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
