//! Isolated environment handle.
//!
//! Wraps one backend context with the bookkeeping the pool needs: lifecycle
//! state, ceiling snapshot, age, use count and the contamination flag. The
//! pool owns every environment; a request borrows one through a lease.

use crate::config::types::{CapturedOutput, LimitBreach, ResourceLimits, Result, SandboxError};
use crate::core::backend::{
    CommandLimits, CommandSpec, ContextHandle, IsolationBackend, RunWorkspace, OUT_DIR, WORK_DIR,
};
use crate::observability::audit::events;
use crate::safety::paths::{resolve_within, tree_size};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvironmentState {
    Provisioning,
    Ready,
    InUse,
    Draining,
    Destroyed,
}

/// How a command inside the environment ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    ResourceExceeded(LimitBreach),
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub elapsed: Duration,
    pub memory_peak: Option<u64>,
    pub cpu_time: Option<Duration>,
}

pub struct IsolatedEnvironment {
    id: String,
    state: EnvironmentState,
    ceiling: ResourceLimits,
    active: ResourceLimits,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    use_count: u32,
    contamination: Option<String>,
    context: ContextHandle,
    backend: Arc<dyn IsolationBackend>,
}

impl std::fmt::Debug for IsolatedEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolatedEnvironment")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("use_count", &self.use_count)
            .field("contamination", &self.contamination)
            .field("root", &self.context.root)
            .finish()
    }
}

impl IsolatedEnvironment {
    /// Allocate a fresh environment sized for `ceiling`
    pub fn provision(backend: Arc<dyn IsolationBackend>, ceiling: ResourceLimits) -> Result<Self> {
        let id = Uuid::new_v4().simple().to_string();
        log::debug!(
            "Provisioning environment {} on {} backend",
            id,
            backend.backend_name()
        );

        let context = backend.create_context(&id, &ceiling).map_err(|e| match e {
            SandboxError::Provisioning(msg) => SandboxError::Provisioning(msg),
            other => SandboxError::Provisioning(format!("environment {}: {}", id, other)),
        })?;

        events::environment_provisioned(&id);
        Ok(Self {
            id,
            state: EnvironmentState::Ready,
            active: ceiling.clone(),
            ceiling,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            use_count: 0,
            contamination: None,
            context,
            backend,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    pub fn ceiling(&self) -> &ResourceLimits {
        &self.ceiling
    }

    pub fn active_limits(&self) -> &ResourceLimits {
        &self.active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_wall
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn is_contaminated(&self) -> bool {
        self.contamination.is_some()
    }

    pub fn contamination_reason(&self) -> Option<&str> {
        self.contamination.as_deref()
    }

    pub fn context(&self) -> &ContextHandle {
        &self.context
    }

    pub fn workspace(&self) -> RunWorkspace {
        self.context.workspace()
    }

    /// Flag the environment as unfit for reuse. The first reason sticks.
    pub fn mark_contaminated(&mut self, reason: impl Into<String>) {
        if self.contamination.is_none() {
            let reason = reason.into();
            log::warn!("Environment {} contaminated: {}", self.id, reason);
            events::environment_contaminated(&self.id, &reason);
            self.contamination = Some(reason);
        }
    }

    /// Narrow the limits applied to commands for the current request
    pub fn set_active_limits(&mut self, limits: ResourceLimits) -> Result<()> {
        if !self.ceiling.satisfies(&limits) {
            return Err(SandboxError::InvalidLimits(format!(
                "requested limits exceed the ceiling of environment {}",
                self.id
            )));
        }
        self.active = limits;
        Ok(())
    }

    /// True when the environment should be destroyed rather than reused
    pub fn is_expired(&self, max_reuses: u32, max_age: Duration) -> bool {
        self.use_count >= max_reuses || self.age() >= max_age
    }

    pub(crate) fn begin_use(&mut self) {
        self.state = EnvironmentState::InUse;
        self.use_count += 1;
    }

    pub(crate) fn health_check(&self) -> Result<()> {
        self.backend.health_check(&self.context)
    }

    fn ensure_usable(&self) -> Result<()> {
        match self.state {
            EnvironmentState::Destroyed | EnvironmentState::Draining => {
                Err(SandboxError::Infrastructure(format!(
                    "environment {} is {:?}",
                    self.id, self.state
                )))
            }
            _ => Ok(()),
        }
    }

    /// Absolute path of `relative` inside the environment root
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        resolve_within(&self.context.root, relative).inspect_err(|_| {
            events::path_traversal_attempt(&self.id, relative);
        })
    }

    /// Write `content` to `relative`, creating parent directories. Fails when
    /// the path leaves the root or the write would exceed the disk quota.
    pub fn write_file(&self, relative: &str, content: &[u8]) -> Result<PathBuf> {
        self.ensure_usable()?;
        let path = self.resolve(relative)?;

        let used = tree_size(&self.context.root)?;
        let replaced = std::fs::symlink_metadata(&path)
            .map(|m| if m.is_file() { m.len() } else { 0 })
            .unwrap_or(0);
        let projected = used.saturating_sub(replaced) + content.len() as u64;
        if projected > self.active.disk_bytes {
            return Err(SandboxError::Filesystem(format!(
                "disk quota exceeded writing {}: {} > {} bytes",
                relative, projected, self.active.disk_bytes
            )));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SandboxError::Filesystem(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .map_err(|e| {
                SandboxError::Filesystem(format!("cannot open {}: {}", path.display(), e))
            })?;
        file.write_all(content).map_err(|e| {
            SandboxError::Filesystem(format!("cannot write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    pub fn ensure_dir(&self, relative: &str) -> Result<PathBuf> {
        self.ensure_usable()?;
        let path = self.resolve(relative)?;
        std::fs::create_dir_all(&path).map_err(|e| {
            SandboxError::Filesystem(format!("cannot create {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// A command skeleton bound to this environment's active limits
    pub fn command(&self, program: impl Into<PathBuf>) -> CommandSpec {
        CommandSpec::new(
            program,
            self.context.root.join(WORK_DIR),
            CommandLimits::from_limits(&self.active),
        )
    }

    /// Where build artifacts go
    pub fn artifact_path(&self, name: &str) -> PathBuf {
        self.context.root.join(OUT_DIR).join(name)
    }

    /// Run a command. Timeouts, limit breaches, backend faults and
    /// surviving processes contaminate the environment.
    pub fn run(&mut self, command: &CommandSpec) -> Result<RunReport> {
        self.ensure_usable()?;
        if let Some(reason) = &self.contamination {
            return Err(SandboxError::Infrastructure(format!(
                "environment {} is contaminated ({}); refusing to run",
                self.id, reason
            )));
        }
        if !command.workdir.starts_with(&self.context.root) {
            return Err(SandboxError::InvalidRequest(format!(
                "working directory {} is outside the environment",
                command.workdir.display()
            )));
        }

        log::debug!("[{}] exec {}", self.id, command.display());
        let mut raw = match self.backend.run_in_context(&self.context, command) {
            Ok(raw) => raw,
            Err(e) => {
                self.mark_contaminated(format!("backend failure: {}", e));
                return Err(match e {
                    SandboxError::Infrastructure(msg) => SandboxError::Infrastructure(msg),
                    other => SandboxError::Infrastructure(other.to_string()),
                });
            }
        };

        if raw.stray_processes {
            self.mark_contaminated("processes outlived the command");
        }
        // RLIMIT_FSIZE caps single files; the quota covers the whole root.
        if !raw.timed_out && raw.breach.is_none() {
            match tree_size(&self.context.root) {
                Ok(used) if used > self.active.disk_bytes => {
                    log::warn!(
                        "[{}] {} left {} bytes on disk, quota {}",
                        self.id,
                        command.display(),
                        used,
                        self.active.disk_bytes
                    );
                    raw.breach = Some(LimitBreach::Disk);
                }
                Ok(_) => {}
                Err(e) => self.mark_contaminated(format!("cannot measure disk usage: {}", e)),
            }
        }

        let status = if raw.timed_out {
            events::wall_time_exceeded(&self.id, command.timeout.as_millis() as u64);
            self.mark_contaminated(format!(
                "wall timeout after {} ms",
                command.timeout.as_millis()
            ));
            RunStatus::TimedOut
        } else if let Some(breach) = raw.breach {
            events::limit_violation(&self.id, breach);
            self.mark_contaminated(format!("{} limit exceeded", breach));
            RunStatus::ResourceExceeded(breach)
        } else if let Some(signal) = raw.signal {
            RunStatus::Signaled(signal)
        } else if let Some(code) = raw.exit_code {
            RunStatus::Exited(code)
        } else {
            self.mark_contaminated("backend reported neither exit code nor signal");
            return Err(SandboxError::Infrastructure(format!(
                "no exit status for {} in environment {}",
                command.display(),
                self.id
            )));
        };

        Ok(RunReport {
            status,
            stdout: raw.stdout,
            stderr: raw.stderr,
            elapsed: raw.elapsed,
            memory_peak: raw.memory_peak,
            cpu_time: raw.cpu_time,
        })
    }

    /// Restore the clean state. Contaminated environments cannot be reset.
    pub fn reset(&mut self) -> Result<()> {
        self.ensure_usable()?;
        if let Some(reason) = &self.contamination {
            return Err(SandboxError::ResetUnsupported(format!(
                "environment {} is contaminated: {}",
                self.id, reason
            )));
        }
        self.state = EnvironmentState::Draining;
        self.backend.reset_context(&self.context)?;
        self.active = self.ceiling.clone();
        self.state = EnvironmentState::Ready;
        events::environment_reset(&self.id, self.use_count);
        Ok(())
    }

    /// Release the backend context. Calling it again after success is a no-op;
    /// after a failure it retries.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == EnvironmentState::Destroyed {
            return Ok(());
        }
        self.state = EnvironmentState::Draining;
        match self.backend.destroy_context(&self.context) {
            Ok(()) => {
                self.state = EnvironmentState::Destroyed;
                let reason = self.contamination.as_deref().unwrap_or("retired");
                events::environment_destroyed(&self.id, reason);
                Ok(())
            }
            Err(e) => {
                events::destroy_failure(&self.id, &e.to_string());
                Err(match e {
                    SandboxError::Infrastructure(msg) => SandboxError::Infrastructure(msg),
                    other => SandboxError::Infrastructure(format!(
                        "destroying environment {}: {}",
                        self.id, other
                    )),
                })
            }
        }
    }
}

impl Drop for IsolatedEnvironment {
    fn drop(&mut self) {
        if self.state != EnvironmentState::Destroyed {
            log::warn!("Environment {} dropped without destroy; destroying now", self.id);
            if let Err(e) = self.destroy() {
                log::error!("Environment {} leaked: {}", self.id, e);
            }
        }
    }
}
