// Startup validation of the service configuration.
// Errors describe settings the service cannot run with; warnings describe
// settings that work but are probably not what the operator meant.

use crate::config::limiter::ResourceLimiter;
use crate::config::service::{ServiceConfig, SplitPolicy};
use crate::config::types::{ResourceLimits, Result, SandboxError};
use std::path::Path;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

const KNOWN_EDITIONS: &[&str] = &["2015", "2018", "2021", "2024"];

/// Validate config at startup. In strict mode any error is returned as
/// `SandboxError::Config`; otherwise the caller decides.
pub fn validate_config(config: &ServiceConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_pool(config, &mut result);
    validate_limits(config, &mut result);
    validate_timeouts(config, &mut result);
    validate_toolchain(config, &mut result);
    validate_backend(config, &mut result);

    if config.backend.strict && !result.is_valid() {
        let error_msg = format!(
            "Config validation failed in strict mode:\n{}",
            result.errors.join("\n")
        );
        return Err(SandboxError::Config(error_msg));
    }

    Ok(result)
}

fn validate_pool(config: &ServiceConfig, result: &mut ValidationResult) {
    let pool = &config.pool;
    if pool.capacity == 0 {
        result.add_error("pool.capacity cannot be zero".to_string());
    }
    if pool.prewarm > pool.capacity {
        result.add_error(format!(
            "pool.prewarm ({}) exceeds pool.capacity ({})",
            pool.prewarm, pool.capacity
        ));
    }
    if pool.acquire_timeout_ms == 0 {
        result.add_warning(
            "pool.acquire_timeout_ms is zero; requests fail immediately when the pool is busy"
                .to_string(),
        );
    }
    if pool.max_reuses == 0 {
        result.add_warning(
            "pool.max_reuses is zero; every environment is destroyed after one request"
                .to_string(),
        );
    }
    if pool.max_age_ms == 0 {
        result.add_error("pool.max_age_ms cannot be zero".to_string());
    }
}

fn validate_limits(config: &ServiceConfig, result: &mut ValidationResult) {
    let limits = &config.limits;

    if let Err(e) = ResourceLimiter::new(limits) {
        result.add_error(e.to_string());
    }

    for (label, set) in [("minimum", &limits.minimum), ("maximum", &limits.maximum)] {
        for field in zero_fields(set) {
            result.add_error(format!("limits.{label}.{field} cannot be zero"));
        }
    }

    if !limits.maximum.satisfies(&limits.default) {
        result.add_warning(
            "limits.default exceeds limits.maximum in some field; it will be clamped".to_string(),
        );
    }

    if limits.maximum.wall_time_ms < limits.maximum.cpu_time_ms {
        result.add_warning(format!(
            "limits.maximum.wall_time_ms ({}) is below cpu_time_ms ({}); CPU limit is unreachable",
            limits.maximum.wall_time_ms, limits.maximum.cpu_time_ms
        ));
    }
}

fn zero_fields(limits: &ResourceLimits) -> Vec<&'static str> {
    let mut zero = Vec::new();
    if limits.cpu_time_ms == 0 {
        zero.push("cpu_time_ms");
    }
    if limits.wall_time_ms == 0 {
        zero.push("wall_time_ms");
    }
    if limits.memory_bytes == 0 {
        zero.push("memory_bytes");
    }
    if limits.output_bytes == 0 {
        zero.push("output_bytes");
    }
    if limits.process_count == 0 {
        zero.push("process_count");
    }
    if limits.disk_bytes == 0 {
        zero.push("disk_bytes");
    }
    zero
}

fn validate_timeouts(config: &ServiceConfig, result: &mut ValidationResult) {
    match config.timeouts.split {
        SplitPolicy::Fixed { compile_ms } => {
            if compile_ms == 0 {
                result.add_error("timeouts.split.compile_ms cannot be zero".to_string());
            }
        }
        SplitPolicy::Proportional {
            run_reserve_percent,
        } => {
            if run_reserve_percent == 0 || run_reserve_percent >= 100 {
                result.add_error(format!(
                    "timeouts.split.run_reserve_percent must be in 1..=99, got {}",
                    run_reserve_percent
                ));
            } else if run_reserve_percent > 80 {
                result.add_warning(format!(
                    "timeouts.split.run_reserve_percent {} leaves little time for rustc",
                    run_reserve_percent
                ));
            }
        }
    }
    if config.timeouts.disassemble_ms == 0 {
        result.add_error("timeouts.disassemble_ms cannot be zero".to_string());
    }
}

fn validate_toolchain(config: &ServiceConfig, result: &mut ValidationResult) {
    let tc = &config.toolchain;
    if !KNOWN_EDITIONS.contains(&tc.edition.as_str()) {
        result.add_error(format!("toolchain.edition {:?} is not a Rust edition", tc.edition));
    }
    if tc.compile_memory_bytes < config.limits.maximum.memory_bytes {
        result.add_warning(format!(
            "toolchain.compile_memory_bytes ({}) is below limits.maximum.memory_bytes ({})",
            tc.compile_memory_bytes, config.limits.maximum.memory_bytes
        ));
    }
    if tc.compile_process_count < 2 {
        result.add_error(
            "toolchain.compile_process_count must allow rustc to spawn the linker".to_string(),
        );
    }
    if tc.disassembly_max_bytes == 0 {
        result.add_error("toolchain.disassembly_max_bytes cannot be zero".to_string());
    }
}

fn validate_backend(config: &ServiceConfig, result: &mut ValidationResult) {
    let backend = &config.backend;
    if !backend.work_root.is_absolute() {
        result.add_error(format!(
            "backend.work_root must be absolute path: {:?}",
            backend.work_root
        ));
    }
    if backend.use_cgroups {
        if !backend.cgroup_root.starts_with("/sys/fs/cgroup") {
            result.add_warning(format!(
                "backend.cgroup_root {:?} is outside /sys/fs/cgroup",
                backend.cgroup_root
            ));
        }
    } else if backend.strict {
        result.add_error(
            "backend.use_cgroups must be true in strict mode (environments cannot be reset without it)"
                .to_string(),
        );
    }
    if backend.destroy_retries == 0 {
        result.add_error("backend.destroy_retries cannot be zero".to_string());
    }
    if backend.isolate_filesystem {
        if backend.sandbox_uid == 0 || backend.sandbox_gid == 0 {
            result.add_error(
                "backend.sandbox_uid and backend.sandbox_gid must not be root".to_string(),
            );
        }
        for path in backend.jail_paths.iter().filter(|p| !p.is_absolute()) {
            result.add_error(format!("backend.jail_paths entry {:?} is not absolute", path));
        }
    } else if backend.strict {
        result.add_error(
            "backend.isolate_filesystem must be true in strict mode".to_string(),
        );
    }
}

/// Report host facilities the process backend relies on that are missing
pub fn check_system_capabilities() -> Vec<String> {
    let mut missing = Vec::new();

    if !Path::new("/sys/fs/cgroup/cgroup.controllers").exists() {
        missing.push("cgroup v2 unified hierarchy not mounted".to_string());
    }

    #[cfg(target_os = "linux")]
    {
        if !Path::new("/proc/self/ns/net").exists() {
            missing.push("network namespaces not available".to_string());
        }
        for (ns, what) in [("mnt", "mount"), ("pid", "PID")] {
            if !Path::new("/proc/self/ns").join(ns).exists() {
                missing.push(format!("{} namespaces not available", what));
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        missing.push("Linux-only features not available on this platform".to_string());
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = ServiceConfig::default();
        let result = validate_config(&config).unwrap();
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_zero_capacity() {
        let mut config = ServiceConfig::default();
        config.pool.capacity = 0;

        let result = validate_config(&config).unwrap();
        assert!(!result.is_valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("pool.capacity cannot be zero")));
    }

    #[test]
    fn test_inverted_limits() {
        let mut config = ServiceConfig::default();
        config.limits.minimum.memory_bytes = config.limits.maximum.memory_bytes + 1;

        let result = validate_config(&config).unwrap();
        assert!(!result.is_valid());
        assert!(result.errors.iter().any(|e| e.contains("memory_bytes")));
    }

    #[test]
    fn test_zero_maximum_field() {
        let mut config = ServiceConfig::default();
        config.limits.maximum.output_bytes = 0;
        config.limits.minimum.output_bytes = 0;

        let result = validate_config(&config).unwrap();
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("limits.maximum.output_bytes cannot be zero")));
    }

    #[test]
    fn test_proportional_split_bounds() {
        let mut config = ServiceConfig::default();
        config.timeouts.split = SplitPolicy::Proportional {
            run_reserve_percent: 100,
        };
        let result = validate_config(&config).unwrap();
        assert!(!result.is_valid());

        config.timeouts.split = SplitPolicy::Proportional {
            run_reserve_percent: 90,
        };
        let result = validate_config(&config).unwrap();
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn test_unknown_edition() {
        let mut config = ServiceConfig::default();
        config.toolchain.edition = "2020".to_string();
        let result = validate_config(&config).unwrap();
        assert!(result.errors.iter().any(|e| e.contains("edition")));
    }

    #[test]
    fn test_relative_work_root_fatal_in_strict_mode() {
        let mut config = ServiceConfig::default();
        config.backend.work_root = "relative/dir".into();
        config.backend.strict = true;

        assert!(matches!(
            validate_config(&config),
            Err(SandboxError::Config(_))
        ));
    }

    #[test]
    fn test_strict_requires_cgroups() {
        let mut config = ServiceConfig::default();
        config.backend.strict = true;
        config.backend.use_cgroups = false;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_jail_identity_and_paths() {
        let mut config = ServiceConfig::default();
        config.backend.sandbox_uid = 0;
        config.backend.jail_paths.push("usr/local".into());
        let result = validate_config(&config).unwrap();
        assert!(result.errors.iter().any(|e| e.contains("must not be root")));
        assert!(result.errors.iter().any(|e| e.contains("\"usr/local\" is not absolute")));

        let mut config = ServiceConfig::default();
        config.backend.strict = true;
        config.backend.isolate_filesystem = false;
        assert!(validate_config(&config).is_err());
    }
}
