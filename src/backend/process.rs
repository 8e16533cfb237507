//! Process isolation backend.
//!
//! A context is a private directory under the work root plus an optional
//! cgroup v2 child. Commands run as their own session leader, join the
//! context cgroup and receive rlimits and, when asked, a fresh network
//! namespace before exec. With filesystem isolation on they additionally
//! run inside a jail (see [`crate::kernel::mount`]): a private root, a PID
//! namespace, and dropped credentials when the service runs as root.

use crate::config::service::BackendConfig;
use crate::config::types::{LimitBreach, ResourceLimits, Result, SandboxError};
use crate::core::backend::{
    CommandLimits, CommandSpec, ContextHandle, IsolationBackend, RawRun, OUT_DIR, TEMP_DIR,
    WORK_DIR,
};
use crate::kernel::cgroup::{unified_hierarchy_available, CgroupCounters, CgroupV2, ContextCgroup};
use crate::kernel::mount::{Jail, JAIL_DIR};
use crate::kernel::namespace::NetworkIsolation;
use crate::kernel::rlimits::RlimitPlan;
use crate::kernel::signal::{group_alive, terminate_group};
use crate::observability::audit::events;
use crate::safety::cleanup::{clear_directory, remove_tree};
use crate::utils::output::OutputCollector;
use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chown, Gid, Pid, Uid};
use std::ffi::CString;
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// How long pipes may stay open after the command exits
const OUTPUT_GRACE: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Marker the Rust runtime prints when an allocation fails under RLIMIT_AS
const ALLOC_FAILURE_MARKER: &str = "memory allocation of";
/// Program run inside a fresh jail at startup
const JAIL_CHECK_PROGRAM: &str = "/bin/true";
const JAIL_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ProcessBackend {
    work_root: PathBuf,
    cgroups: Option<CgroupV2>,
    network: NetworkIsolation,
    strict: bool,
    destroy_retries: u32,
    jail: Option<Jail>,
}

impl ProcessBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        Self::with_toolchain_paths(config, &[])
    }

    /// Prepare the work root, the parent cgroup and check network and
    /// filesystem isolation. `toolchain` directories are bound read-only into
    /// the jail next to `jail_paths`. In strict mode any missing control is
    /// fatal; otherwise it is logged and audited as degraded.
    pub fn with_toolchain_paths(config: &BackendConfig, toolchain: &[PathBuf]) -> Result<Self> {
        fs::create_dir_all(&config.work_root).map_err(|e| {
            SandboxError::Provisioning(format!(
                "cannot create work root {}: {}",
                config.work_root.display(),
                e
            ))
        })?;
        fs::set_permissions(&config.work_root, fs::Permissions::from_mode(0o700))?;

        let cgroups = if !config.use_cgroups {
            None
        } else if !unified_hierarchy_available() {
            degrade(config.strict, "cgroup v2 hierarchy not mounted")?;
            None
        } else {
            match CgroupV2::new(&config.cgroup_root, config.strict) {
                Ok(cg) => Some(cg),
                Err(e) => {
                    degrade(config.strict, &format!("cgroup setup failed: {}", e))?;
                    None
                }
            }
        };

        let network = if config.isolate_network {
            let mode = NetworkIsolation::for_current_user();
            match mode.probe() {
                Ok(()) => mode,
                Err(e) => {
                    degrade(config.strict, &format!("network isolation unavailable: {}", e))?;
                    NetworkIsolation::Disabled
                }
            }
        } else {
            NetworkIsolation::Disabled
        };

        let jail = config.isolate_filesystem.then(|| {
            let mut readonly = config.jail_paths.clone();
            readonly.extend_from_slice(toolchain);
            Jail::new(&readonly, config.sandbox_uid, config.sandbox_gid)
        });

        let mut backend = Self {
            work_root: config.work_root.clone(),
            cgroups,
            network,
            strict: config.strict,
            destroy_retries: config.destroy_retries,
            jail,
        };
        if backend.jail.is_some() {
            if let Err(e) = backend.check_jail() {
                degrade(config.strict, &format!("filesystem isolation unavailable: {}", e))?;
                backend.jail = None;
            }
        }

        log::info!(
            "Process backend ready: root={} cgroups={} network={:?} jail={} strict={}",
            config.work_root.display(),
            backend.cgroups.is_some(),
            backend.network,
            backend.jail.is_some(),
            config.strict
        );
        Ok(backend)
    }

    /// Run a trivial command in a throwaway jailed context
    fn check_jail(&self) -> Result<()> {
        let id = format!("jail-check-{}", uuid::Uuid::new_v4().simple());
        let limits = ResourceLimits::default();
        let ctx = self.create_context(&id, &limits)?;
        let spec = CommandSpec::new(
            JAIL_CHECK_PROGRAM,
            ctx.root.join(WORK_DIR),
            CommandLimits::from_limits(&limits),
        )
        .timeout(JAIL_CHECK_TIMEOUT);
        let outcome = self.run_in_context(&ctx, &spec);
        if let Err(e) = self.destroy_context(&ctx) {
            log::warn!("Cannot remove jail check context {}: {}", id, e);
        }
        let run = outcome?;
        if run.exit_code == Some(0) {
            return Ok(());
        }
        Err(SandboxError::Infrastructure(format!(
            "{} ended with exit={:?} signal={:?}: {}",
            JAIL_CHECK_PROGRAM,
            run.exit_code,
            run.signal,
            run.stderr.text().trim()
        )))
    }

    pub fn cgroups_enabled(&self) -> bool {
        self.cgroups.is_some()
    }

    pub fn network_isolation(&self) -> NetworkIsolation {
        self.network
    }

    pub fn filesystem_isolated(&self) -> bool {
        self.jail.is_some()
    }

    fn context_root(&self, id: &str) -> PathBuf {
        self.work_root.join(format!("env-{}", id))
    }

    fn make_layout(&self, root: &Path) -> Result<()> {
        let owner = self.jail.as_ref().and_then(Jail::owner);
        for dir in [WORK_DIR, OUT_DIR, TEMP_DIR] {
            let path = root.join(dir);
            create_dir(&path)?;
            // Jailed commands run as the sandbox user.
            if let Some((uid, gid)) = owner {
                chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
                    SandboxError::Filesystem(format!("cannot chown {}: {}", path.display(), e))
                })?;
            }
        }
        if self.jail.is_some() {
            create_dir(&root.join(JAIL_DIR))?;
        }
        Ok(())
    }

    fn context_cgroup(ctx: &ContextHandle) -> Option<ContextCgroup> {
        ctx.cgroup.clone().map(ContextCgroup::at)
    }

    fn build_command(&self, ctx: &ContextHandle, spec: &CommandSpec) -> Result<Command> {
        let temp = ctx.root.join(TEMP_DIR);
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.workdir)
            .env_clear()
            .env("PATH", DEFAULT_PATH)
            .env("HOME", &temp)
            .env("TMPDIR", &temp)
            .env("LANG", "C.UTF-8")
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let procs = match &ctx.cgroup {
            Some(path) => Some(
                CString::new(path.join("cgroup.procs").as_os_str().as_bytes()).map_err(|_| {
                    SandboxError::Infrastructure(format!(
                        "cgroup path contains NUL: {}",
                        path.display()
                    ))
                })?,
            ),
            None => None,
        };
        let rlimits = RlimitPlan::from_limits(&spec.limits);
        let network = if spec.isolate_network {
            self.network
        } else {
            NetworkIsolation::Disabled
        };
        let jail = match &self.jail {
            Some(jail) => {
                let writable: Vec<PathBuf> = [WORK_DIR, OUT_DIR, TEMP_DIR]
                    .iter()
                    .map(|dir| ctx.root.join(dir))
                    .collect();
                let procs_path = ctx.cgroup.as_ref().map(|cg| cg.join("cgroup.procs"));
                Some(jail.plan(
                    &ctx.root,
                    &writable,
                    &spec.workdir,
                    procs_path.as_deref(),
                    network,
                )?)
            }
            None => None,
        };

        // Runs between fork and exec: raw syscalls only.
        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(jail) = &jail {
                    return jail.enter(rlimits);
                }
                if let Some(procs) = &procs {
                    join_cgroup(procs)?;
                }
                network.enter()?;
                rlimits.apply()
            });
        }
        Ok(command)
    }
}

fn create_dir(path: &Path) -> Result<()> {
    match fs::DirBuilder::new().mode(0o755).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(SandboxError::Filesystem(format!(
            "cannot create {}: {}",
            path.display(),
            e
        ))),
    }
}

fn degrade(strict: bool, message: &str) -> Result<()> {
    if strict {
        return Err(SandboxError::Provisioning(message.to_string()));
    }
    log::warn!("{} (continuing in permissive mode)", message);
    events::control_degraded(message);
    Ok(())
}

/// Move the calling process into the cgroup whose `cgroup.procs` is `procs`
fn join_cgroup(procs: &CString) -> std::io::Result<()> {
    let fd = unsafe { libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // "0" means the writing process itself.
    let written = unsafe { libc::write(fd, b"0".as_ptr() as *const libc::c_void, 1) };
    let err = std::io::Error::last_os_error();
    unsafe {
        libc::close(fd);
    }
    if written != 1 {
        return Err(err);
    }
    Ok(())
}

/// Decide which limit, if any, killed the command
fn classify_breach(
    signal: Option<i32>,
    before: CgroupCounters,
    after: CgroupCounters,
    cpu_exceeded: bool,
    pids_exceeded: bool,
    stderr: &str,
) -> Option<LimitBreach> {
    if after.oom_kill > before.oom_kill {
        return Some(LimitBreach::Memory);
    }
    if cpu_exceeded || signal == Some(libc::SIGXCPU) {
        return Some(LimitBreach::CpuTime);
    }
    if signal == Some(libc::SIGXFSZ) {
        return Some(LimitBreach::Disk);
    }
    // A fork refused by pids.max counts even when the program exited on its own.
    if pids_exceeded || after.pids_max > before.pids_max {
        return Some(LimitBreach::Processes);
    }
    if signal == Some(libc::SIGABRT) && stderr.contains(ALLOC_FAILURE_MARKER) {
        return Some(LimitBreach::Memory);
    }
    None
}

impl IsolationBackend for ProcessBackend {
    fn backend_name(&self) -> &str {
        "process"
    }

    fn create_context(&self, id: &str, ceiling: &ResourceLimits) -> Result<ContextHandle> {
        let root = self.context_root(id);
        fs::DirBuilder::new()
            .mode(0o700)
            .create(&root)
            .map_err(|e| {
                SandboxError::Provisioning(format!("cannot create {}: {}", root.display(), e))
            })?;
        if let Err(e) = self.make_layout(&root) {
            let _ = remove_tree(&root);
            return Err(e);
        }

        let mut handle = ContextHandle::new(id, root);
        if let Some(cgroups) = &self.cgroups {
            let created = cgroups.create(id).and_then(|cg| {
                cg.set_limits(ceiling.memory_bytes, ceiling.process_count)
                    .map(|()| cg)
            });
            match created {
                Ok(cg) => handle.cgroup = Some(cg.path().to_path_buf()),
                Err(e) => {
                    let _ = ContextCgroup::at(cgroups.instance_path(id)).remove();
                    let _ = remove_tree(&handle.root);
                    return Err(SandboxError::Provisioning(format!(
                        "cgroup for context {}: {}",
                        id, e
                    )));
                }
            }
        }
        log::debug!("Created context {} at {}", id, handle.root.display());
        Ok(handle)
    }

    fn run_in_context(&self, ctx: &ContextHandle, spec: &CommandSpec) -> Result<RawRun> {
        if !spec.workdir.starts_with(&ctx.root) {
            return Err(SandboxError::Infrastructure(format!(
                "workdir {} escapes context {}",
                spec.workdir.display(),
                ctx.id
            )));
        }

        let cgroup = Self::context_cgroup(ctx);
        if let Some(cg) = &cgroup {
            cg.set_limits(spec.limits.memory_bytes, spec.limits.process_count)?;
            cg.reset_peak();
        }
        let before = cgroup.as_ref().map(|cg| cg.counters()).unwrap_or_default();
        let cpu_before = cgroup.as_ref().and_then(|cg| cg.cpu_usage());

        let mut command = self.build_command(ctx, spec)?;
        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            SandboxError::Infrastructure(format!("cannot spawn {}: {}", spec.program.display(), e))
        })?;
        let pid = Pid::from_raw(child.id() as i32);

        let stdin_writer = match (child.stdin.take(), spec.stdin.clone()) {
            (Some(mut pipe), Some(data)) => Some(thread::spawn(move || {
                // The program may exit without reading; a broken pipe is fine.
                let _ = pipe.write_all(&data);
            })),
            _ => None,
        };
        let collector = OutputCollector::start(
            child.stdout.take(),
            child.stderr.take(),
            spec.limits.output_bytes as usize,
        );

        let mut timed_out = false;
        let mut cpu_exceeded = false;
        let mut pids_exceeded = false;
        let mut killed = false;
        let mut exit_code = None;
        let mut signal = None;

        loop {
            let flags = if killed {
                None
            } else {
                Some(WaitPidFlag::WNOHANG)
            };
            match waitpid(pid, flags) {
                Ok(WaitStatus::StillAlive) => {
                    if started.elapsed() >= spec.timeout {
                        timed_out = true;
                    } else if let Some(cg) = &cgroup {
                        if cg.counters().pids_max > before.pids_max {
                            pids_exceeded = true;
                        } else if let (Some(now), Some(base)) = (cg.cpu_usage(), cpu_before) {
                            cpu_exceeded = now.saturating_sub(base) > spec.limits.cpu_time;
                        }
                    }
                    if timed_out || cpu_exceeded || pids_exceeded {
                        let report = terminate_group(pid, Duration::ZERO);
                        for note in &report.notes {
                            log::debug!("[{}] {}", ctx.id, note);
                        }
                        if let Some(cg) = &cgroup {
                            let _ = cg.kill_all();
                        }
                        killed = true;
                    } else {
                        thread::sleep(POLL_INTERVAL);
                    }
                }
                Ok(WaitStatus::Exited(_, code)) => {
                    exit_code = Some(code);
                    break;
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    signal = Some(sig as i32);
                    break;
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    let _ = terminate_group(pid, Duration::ZERO);
                    return Err(SandboxError::Infrastructure(format!(
                        "waitpid({}) failed: {}",
                        pid, e
                    )));
                }
            }
        }
        let elapsed = started.elapsed();

        // Anything left in the session or cgroup outlived the command.
        let mut stray = false;
        if group_alive(pid) {
            stray = !killed;
            terminate_group(pid, Duration::ZERO);
        }
        if let Some(cg) = &cgroup {
            if cg.is_populated() {
                stray |= !killed;
                let _ = cg.kill_all();
                if !cg.wait_empty(DRAIN_TIMEOUT) {
                    log::error!("[{}] cgroup still populated after kill", ctx.id);
                    stray = true;
                }
            }
        }

        let output = collector.finish(OUTPUT_GRACE);
        if output.streams_left_open {
            stray = true;
        }
        if let Some(writer) = stdin_writer {
            let _ = writer.join();
        }

        let after = cgroup.as_ref().map(|cg| cg.counters()).unwrap_or_default();
        let breach = if timed_out {
            None
        } else {
            classify_breach(
                signal,
                before,
                after,
                cpu_exceeded,
                pids_exceeded,
                &output.stderr.text(),
            )
        };
        let cpu_time = match (cgroup.as_ref().and_then(|cg| cg.cpu_usage()), cpu_before) {
            (Some(now), Some(base)) => Some(now.saturating_sub(base)),
            _ => None,
        };

        if stray {
            log::warn!("[{}] processes outlived {}", ctx.id, spec.display());
        }

        Ok(RawRun {
            exit_code,
            signal,
            timed_out,
            breach,
            stdout: output.stdout,
            stderr: output.stderr,
            elapsed,
            memory_peak: cgroup.as_ref().and_then(|cg| cg.memory_peak()),
            cpu_time,
            stray_processes: stray,
        })
    }

    fn reset_context(&self, ctx: &ContextHandle) -> Result<()> {
        match (Self::context_cgroup(ctx), &self.cgroups) {
            (Some(cg), Some(cgroups)) => {
                cg.remove()?;
                let fresh = cgroups.create(&ctx.id)?;
                if fresh.path() != cg.path() {
                    return Err(SandboxError::Infrastructure(format!(
                        "cgroup for {} moved to {}",
                        ctx.id,
                        fresh.path().display()
                    )));
                }
            }
            _ if self.strict => {
                return Err(SandboxError::ResetUnsupported(
                    "no cgroup to prove the context is empty".to_string(),
                ));
            }
            _ => {}
        }
        clear_directory(&ctx.root)?;
        self.make_layout(&ctx.root)?;
        Ok(())
    }

    fn destroy_context(&self, ctx: &ContextHandle) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = Self::context_cgroup(ctx)
                .map(|cg| cg.remove())
                .unwrap_or(Ok(()))
                .and_then(|()| remove_tree(&ctx.root));
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.destroy_retries => {
                    attempt += 1;
                    let backoff = 50 * (1u64 << attempt.min(6)) + fastrand::u64(0..25);
                    log::warn!(
                        "Destroy of context {} failed (attempt {}): {}; retrying in {}ms",
                        ctx.id,
                        attempt,
                        e,
                        backoff
                    );
                    thread::sleep(Duration::from_millis(backoff));
                }
                Err(e) => {
                    return Err(SandboxError::Infrastructure(format!(
                        "cannot destroy context {} after {} retries: {}",
                        ctx.id, attempt, e
                    )))
                }
            }
        }
    }

    fn health_check(&self, ctx: &ContextHandle) -> Result<()> {
        if !ctx.root.join(WORK_DIR).is_dir() {
            return Err(SandboxError::Infrastructure(format!(
                "context {} lost its workspace",
                ctx.id
            )));
        }
        if let Some(path) = &ctx.cgroup {
            if !path.is_dir() {
                return Err(SandboxError::Infrastructure(format!(
                    "context {} lost its cgroup {}",
                    ctx.id,
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(root: &Path) -> ProcessBackend {
        let config = BackendConfig {
            work_root: root.to_path_buf(),
            use_cgroups: false,
            isolate_network: false,
            isolate_filesystem: false,
            ..BackendConfig::default()
        };
        ProcessBackend::new(&config).unwrap()
    }

    /// None when the host cannot build a jail
    fn jailed_backend(root: &Path) -> Option<ProcessBackend> {
        let config = BackendConfig {
            work_root: root.to_path_buf(),
            use_cgroups: false,
            isolate_network: false,
            strict: false,
            ..BackendConfig::default()
        };
        let backend = ProcessBackend::new(&config).unwrap();
        if !backend.filesystem_isolated() {
            eprintln!("skipping: filesystem isolation unavailable");
            return None;
        }
        Some(backend)
    }

    fn shell(ctx: &ContextHandle, script: &str) -> CommandSpec {
        CommandSpec::new(
            "/bin/sh",
            ctx.root.join(WORK_DIR),
            CommandLimits::from_limits(&ResourceLimits::default()),
        )
        .args(["-c", script])
        .timeout(Duration::from_secs(5))
    }

    #[test]
    fn context_layout_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let ctx = backend
            .create_context("t1", &ResourceLimits::default())
            .unwrap();
        assert!(ctx.root.join(WORK_DIR).is_dir());
        assert!(ctx.root.join(OUT_DIR).is_dir());
        assert!(backend.health_check(&ctx).is_ok());

        backend.destroy_context(&ctx).unwrap();
        assert!(!ctx.root.exists());
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn captures_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let ctx = backend
            .create_context("t2", &ResourceLimits::default())
            .unwrap();
        let run = backend
            .run_in_context(&ctx, &shell(&ctx, "cat; echo oops >&2; exit 3").stdin(Some(b"hi".to_vec())))
            .unwrap();
        assert_eq!(run.exit_code, Some(3));
        assert_eq!(run.stdout.text(), "hi");
        assert_eq!(run.stderr.text(), "oops\n");
        assert!(!run.timed_out);
        assert!(!run.stray_processes);
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn environment_is_scrubbed() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let ctx = backend
            .create_context("t3", &ResourceLimits::default())
            .unwrap();
        std::env::set_var("BOLTBOX_LEAK_CHECK", "1");
        let run = backend
            .run_in_context(&ctx, &shell(&ctx, "echo \"${BOLTBOX_LEAK_CHECK:-clean}\"; pwd"))
            .unwrap();
        let text = run.stdout.text();
        assert!(text.starts_with("clean\n"));
        assert!(text.contains("/work"));
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn wall_timeout_kills_group() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let ctx = backend
            .create_context("t4", &ResourceLimits::default())
            .unwrap();
        let spec = shell(&ctx, "sleep 30 & sleep 30").timeout(Duration::from_millis(200));
        let started = Instant::now();
        let run = backend.run_in_context(&ctx, &spec).unwrap();
        assert!(run.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn background_child_is_reported_as_stray() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let ctx = backend
            .create_context("t5", &ResourceLimits::default())
            .unwrap();
        let run = backend
            .run_in_context(&ctx, &shell(&ctx, "sleep 30 >/dev/null 2>&1 </dev/null & exit 0"))
            .unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert!(run.stray_processes);
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn reset_clears_files_without_cgroups_in_permissive_mode() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let ctx = backend
            .create_context("t6", &ResourceLimits::default())
            .unwrap();
        fs::write(ctx.root.join(WORK_DIR).join("main.rs"), "fn main() {}").unwrap();
        backend.reset_context(&ctx).unwrap();
        assert!(!ctx.root.join(WORK_DIR).join("main.rs").exists());
        assert!(ctx.root.join(WORK_DIR).is_dir());
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn breach_classification() {
        let none = CgroupCounters::default();
        let oom = CgroupCounters {
            oom_kill: 1,
            pids_max: 0,
        };
        assert_eq!(
            classify_breach(Some(libc::SIGKILL), none, oom, false, false, ""),
            Some(LimitBreach::Memory)
        );
        assert_eq!(
            classify_breach(Some(libc::SIGXCPU), none, none, false, false, ""),
            Some(LimitBreach::CpuTime)
        );
        assert_eq!(
            classify_breach(Some(libc::SIGXFSZ), none, none, false, false, ""),
            Some(LimitBreach::Disk)
        );
        assert_eq!(
            classify_breach(
                Some(libc::SIGABRT),
                none,
                none,
                false,
                false,
                "memory allocation of 1073741824 bytes failed"
            ),
            Some(LimitBreach::Memory)
        );
        assert_eq!(
            classify_breach(Some(libc::SIGSEGV), none, none, false, false, ""),
            None
        );
        let refused_fork = CgroupCounters {
            oom_kill: 0,
            pids_max: 2,
        };
        assert_eq!(
            classify_breach(None, none, refused_fork, false, false, ""),
            Some(LimitBreach::Processes)
        );
        assert_eq!(
            classify_breach(None, refused_fork, refused_fork, false, false, ""),
            None
        );
    }

    #[test]
    fn jailed_command_runs_as_second_pid_in_private_root() {
        let dir = tempfile::tempdir().unwrap();
        let Some(backend) = jailed_backend(dir.path()) else {
            return;
        };
        let ctx = backend
            .create_context("j1", &ResourceLimits::default())
            .unwrap();
        let run = backend
            .run_in_context(&ctx, &shell(&ctx, "echo $$; ls /proc | grep -c '^[0-9]'"))
            .unwrap();
        let text = run.stdout.text();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("2"));
        let visible: usize = lines.next().unwrap_or("0").trim().parse().unwrap();
        assert!(visible <= 5, "host processes visible: {}", visible);
        assert!(!ctx.root.join(JAIL_DIR).join("usr").exists());
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn jailed_command_cannot_write_outside_its_context() {
        let dir = tempfile::tempdir().unwrap();
        let Some(backend) = jailed_backend(dir.path()) else {
            return;
        };
        let ctx = backend
            .create_context("j2", &ResourceLimits::default())
            .unwrap();
        let escape = dir.path().join("escaped.txt");
        let script = format!(
            "echo inside > result.txt; echo out > {} && echo wrote",
            escape.display()
        );
        let run = backend.run_in_context(&ctx, &shell(&ctx, &script)).unwrap();
        assert!(!run.stdout.text().contains("wrote"));
        assert!(!escape.exists());
        assert_eq!(
            fs::read_to_string(ctx.root.join(WORK_DIR).join("result.txt")).unwrap(),
            "inside\n"
        );
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn jailed_exit_status_and_signal_are_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        let Some(backend) = jailed_backend(dir.path()) else {
            return;
        };
        let ctx = backend
            .create_context("j3", &ResourceLimits::default())
            .unwrap();
        let run = backend.run_in_context(&ctx, &shell(&ctx, "exit 7")).unwrap();
        assert_eq!(run.exit_code, Some(7));
        let run = backend
            .run_in_context(&ctx, &shell(&ctx, "kill -SEGV $$"))
            .unwrap();
        assert_eq!(run.signal, Some(libc::SIGSEGV));
        assert_eq!(run.exit_code, None);
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn jailed_timeout_kills_whole_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let Some(backend) = jailed_backend(dir.path()) else {
            return;
        };
        let ctx = backend
            .create_context("j4", &ResourceLimits::default())
            .unwrap();
        let spec = shell(&ctx, "sleep 30 & sleep 30").timeout(Duration::from_millis(200));
        let started = Instant::now();
        let run = backend.run_in_context(&ctx, &spec).unwrap();
        assert!(run.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
        backend.destroy_context(&ctx).unwrap();
    }

    #[test]
    fn jailed_command_drops_root() {
        if !nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let Some(backend) = jailed_backend(dir.path()) else {
            return;
        };
        let ctx = backend
            .create_context("j5", &ResourceLimits::default())
            .unwrap();
        let run = backend
            .run_in_context(&ctx, &shell(&ctx, "id -u; touch own.txt && echo ok"))
            .unwrap();
        assert_eq!(run.stdout.text(), "65534\nok\n");
        backend.destroy_context(&ctx).unwrap();
    }
}
