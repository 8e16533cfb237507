/// Cgroup v2 control for environment contexts
///
/// Each context gets one child cgroup below a service-owned parent. The
/// child enforces `memory.max` and `pids.max`, kills the whole group on OOM
/// (`memory.oom.group`), and is the source of truth for breach detection
/// through the `oom_kill` and `max` event counters.
use crate::config::types::{Result, SandboxError};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// True when the unified hierarchy is mounted
pub fn unified_hierarchy_available() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse().ok(),
            _ => None,
        }
    })
}

/// Parent cgroup owned by the service
pub struct CgroupV2 {
    base_path: PathBuf,
    strict_mode: bool,
}

impl CgroupV2 {
    /// Prepare the parent cgroup and delegate the memory and pids
    /// controllers to its children
    pub fn new(base_path: &Path, strict_mode: bool) -> Result<Self> {
        fs::create_dir_all(base_path).map_err(|e| {
            SandboxError::Provisioning(format!(
                "cannot create cgroup {}: {}",
                base_path.display(),
                e
            ))
        })?;

        let control = base_path.join("cgroup.subtree_control");
        let enabled = read_trimmed(&control).unwrap_or_default();
        for controller in ["memory", "pids"] {
            if enabled.split_whitespace().any(|c| c == controller) {
                continue;
            }
            if let Err(e) = fs::write(&control, format!("+{}", controller)) {
                let msg = format!(
                    "cannot enable {} controller in {}: {}",
                    controller,
                    base_path.display(),
                    e
                );
                if strict_mode {
                    return Err(SandboxError::Provisioning(msg));
                }
                log::warn!("{} (limits will not be enforced)", msg);
            }
        }

        Ok(CgroupV2 {
            base_path: base_path.to_path_buf(),
            strict_mode,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get cgroup path for a context
    pub fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    /// Create the child cgroup for a context
    pub fn create(&self, instance_id: &str) -> Result<ContextCgroup> {
        let path = self.instance_path(instance_id);
        fs::create_dir_all(&path).map_err(|e| {
            SandboxError::Provisioning(format!("cannot create cgroup {}: {}", path.display(), e))
        })?;

        let group = ContextCgroup { path };
        for (file, value) in [("memory.oom.group", "1"), ("memory.swap.max", "0")] {
            let target = group.path.join(file);
            if !target.exists() {
                continue;
            }
            if let Err(e) = fs::write(&target, value) {
                if self.strict_mode {
                    let _ = fs::remove_dir(&group.path);
                    return Err(SandboxError::Provisioning(format!(
                        "cannot set {}: {}",
                        file, e
                    )));
                }
                log::warn!("Failed to set {} (permissive mode): {}", file, e);
            }
        }
        Ok(group)
    }
}

/// Counters sampled before and after a command to attribute kills
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CgroupCounters {
    pub oom_kill: u64,
    pub pids_max: u64,
}

/// One context's cgroup
#[derive(Clone, Debug)]
pub struct ContextCgroup {
    path: PathBuf,
}

impl ContextCgroup {
    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File a child writes its pid into to join the group
    pub fn procs_file(&self) -> PathBuf {
        self.path.join("cgroup.procs")
    }

    pub fn set_limits(&self, memory_bytes: u64, process_count: u32) -> Result<()> {
        fs::write(self.path.join("memory.max"), memory_bytes.to_string()).map_err(|e| {
            SandboxError::Infrastructure(format!("Failed to set memory limit: {}", e))
        })?;
        fs::write(self.path.join("pids.max"), process_count.to_string()).map_err(|e| {
            SandboxError::Infrastructure(format!("Failed to set process limit: {}", e))
        })?;
        Ok(())
    }

    pub fn counters(&self) -> CgroupCounters {
        let memory_events = read_trimmed(&self.path.join("memory.events")).unwrap_or_default();
        let pids_events = read_trimmed(&self.path.join("pids.events")).unwrap_or_default();
        CgroupCounters {
            oom_kill: keyed_value(&memory_events, "oom_kill").unwrap_or(0),
            pids_max: keyed_value(&pids_events, "max").unwrap_or(0),
        }
    }

    /// memory.peak (kernel 5.19+) with fallback to memory.current
    pub fn memory_peak(&self) -> Option<u64> {
        read_trimmed(&self.path.join("memory.peak"))
            .or_else(|| read_trimmed(&self.path.join("memory.current")))
            .and_then(|v| v.parse().ok())
    }

    /// Restart peak tracking. Needs kernel 6.12+; older kernels keep the
    /// lifetime peak.
    pub fn reset_peak(&self) {
        let _ = fs::write(self.path.join("memory.peak"), "0");
    }

    pub fn cpu_usage(&self) -> Option<Duration> {
        let stat = read_trimmed(&self.path.join("cpu.stat"))?;
        keyed_value(&stat, "usage_usec").map(Duration::from_micros)
    }

    pub fn is_populated(&self) -> bool {
        match read_trimmed(&self.path.join("cgroup.events")) {
            Some(events) => keyed_value(&events, "populated").unwrap_or(0) != 0,
            None => false,
        }
    }

    /// SIGKILL every member. Uses `cgroup.kill` (5.14+) and falls back to
    /// signalling each pid listed in `cgroup.procs`.
    pub fn kill_all(&self) -> Result<()> {
        if fs::write(self.path.join("cgroup.kill"), "1").is_ok() {
            return Ok(());
        }
        let procs = fs::read_to_string(self.procs_file()).map_err(|e| {
            SandboxError::Infrastructure(format!(
                "cannot list {}: {}",
                self.procs_file().display(),
                e
            ))
        })?;
        for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGKILL,
            );
        }
        Ok(())
    }

    /// Poll until no process remains or `timeout` passes
    pub fn wait_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_populated() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Kill members and remove the directory. Missing directory is fine.
    pub fn remove(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        self.kill_all()?;
        if !self.wait_empty(Duration::from_secs(2)) {
            return Err(SandboxError::Infrastructure(format!(
                "cgroup {} still populated after kill",
                self.path.display()
            )));
        }
        match fs::remove_dir(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SandboxError::Infrastructure(format!(
                "Failed to remove cgroup {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_value() {
        let events = "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n";
        assert_eq!(keyed_value(events, "oom_kill"), Some(1));
        assert_eq!(keyed_value(events, "max"), Some(3));
        assert_eq!(keyed_value(events, "missing"), None);
    }

    #[test]
    fn test_counters_from_plain_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("memory.events"), "oom 2\noom_kill 2\n").unwrap();
        fs::write(dir.path().join("pids.events"), "max 5\n").unwrap();
        fs::write(dir.path().join("memory.peak"), "1048576\n").unwrap();
        fs::write(dir.path().join("cpu.stat"), "usage_usec 2500\nuser_usec 2000\n").unwrap();
        fs::write(dir.path().join("cgroup.events"), "populated 0\nfrozen 0\n").unwrap();

        let group = ContextCgroup::at(dir.path().to_path_buf());
        assert_eq!(
            group.counters(),
            CgroupCounters {
                oom_kill: 2,
                pids_max: 5
            }
        );
        assert_eq!(group.memory_peak(), Some(1_048_576));
        assert_eq!(group.cpu_usage(), Some(Duration::from_micros(2500)));
        assert!(!group.is_populated());
    }

    #[test]
    fn test_instance_path() {
        let dir = tempfile::tempdir().unwrap();
        let cgroup = CgroupV2::new(dir.path(), false).unwrap();
        assert_eq!(cgroup.instance_path("abc"), dir.path().join("abc"));
    }
}
