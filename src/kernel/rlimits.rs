//! Per-process resource limits applied between fork and exec.
//!
//! `apply` runs in the forked child, so it only issues `setrlimit` calls and
//! allocates nothing.

use crate::core::backend::CommandLimits;
use nix::sys::resource::{setrlimit, Resource};

const OPEN_FILES: u64 = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitPlan {
    /// RLIMIT_AS; `None` leaves the address space to the cgroup
    pub address_space: Option<u64>,
    /// RLIMIT_CPU soft limit in whole seconds; the hard limit is one second later
    pub cpu_seconds: u64,
    /// RLIMIT_FSIZE
    pub file_size: u64,
    pub open_files: u64,
}

impl RlimitPlan {
    pub fn from_limits(limits: &CommandLimits) -> Self {
        let millis = limits.cpu_time.as_millis() as u64;
        Self {
            address_space: limits
                .enforce_address_space
                .then_some(limits.memory_bytes),
            cpu_seconds: millis.div_ceil(1000).max(1),
            file_size: limits.file_size_bytes,
            open_files: OPEN_FILES,
        }
    }

    pub fn apply(&self) -> std::io::Result<()> {
        if let Some(bytes) = self.address_space {
            setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
        }
        setrlimit(
            Resource::RLIMIT_CPU,
            self.cpu_seconds,
            self.cpu_seconds + 1,
        )?;
        setrlimit(Resource::RLIMIT_FSIZE, self.file_size, self.file_size)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        setrlimit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        Ok(())
    }
}
