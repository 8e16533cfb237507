//! Resource limiter
//!
//! Pure policy: turns a request's partial overrides into the effective limits
//! for one execution, bounded by the service minima and maxima.

use crate::config::service::LimitPolicy;
use crate::config::types::{LimitOverrides, ResourceLimits, Result, SandboxError};

/// Effective limits plus the names of fields that had to be clamped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub limits: ResourceLimits,
    pub clamped: Vec<&'static str>,
}

#[derive(Clone, Debug)]
pub struct ResourceLimiter {
    maximum: ResourceLimits,
    minimum: ResourceLimits,
    default: ResourceLimits,
}

impl ResourceLimiter {
    /// Build a limiter, rejecting bounds where a minimum exceeds its maximum.
    pub fn new(policy: &LimitPolicy) -> Result<Self> {
        check_bounds(&policy.minimum, &policy.maximum)?;
        Ok(Self {
            maximum: policy.maximum.clone(),
            minimum: policy.minimum.clone(),
            default: policy.default.clone(),
        })
    }

    pub fn maximum(&self) -> &ResourceLimits {
        &self.maximum
    }

    pub fn minimum(&self) -> &ResourceLimits {
        &self.minimum
    }

    /// Limits for a request without overrides.
    pub fn defaults(&self) -> ResourceLimits {
        self.effective(&LimitOverrides::default()).limits
    }

    pub fn effective(&self, overrides: &LimitOverrides) -> EffectiveLimits {
        let mut clamped = Vec::new();
        let limits = ResourceLimits {
            cpu_time_ms: clamp_field(
                "cpu_time_ms",
                overrides.cpu_time_ms.unwrap_or(self.default.cpu_time_ms),
                self.minimum.cpu_time_ms,
                self.maximum.cpu_time_ms,
                &mut clamped,
            ),
            wall_time_ms: clamp_field(
                "wall_time_ms",
                overrides.wall_time_ms.unwrap_or(self.default.wall_time_ms),
                self.minimum.wall_time_ms,
                self.maximum.wall_time_ms,
                &mut clamped,
            ),
            memory_bytes: clamp_field(
                "memory_bytes",
                overrides.memory_bytes.unwrap_or(self.default.memory_bytes),
                self.minimum.memory_bytes,
                self.maximum.memory_bytes,
                &mut clamped,
            ),
            output_bytes: clamp_field(
                "output_bytes",
                overrides.output_bytes.unwrap_or(self.default.output_bytes),
                self.minimum.output_bytes,
                self.maximum.output_bytes,
                &mut clamped,
            ),
            process_count: clamp_field(
                "process_count",
                overrides.process_count.unwrap_or(self.default.process_count),
                self.minimum.process_count,
                self.maximum.process_count,
                &mut clamped,
            ),
            disk_bytes: clamp_field(
                "disk_bytes",
                overrides.disk_bytes.unwrap_or(self.default.disk_bytes),
                self.minimum.disk_bytes,
                self.maximum.disk_bytes,
                &mut clamped,
            ),
        };
        EffectiveLimits { limits, clamped }
    }
}

/// One-shot form of [`ResourceLimiter::effective`] for callers that hold the
/// bounds directly.
pub fn effective_limits(
    overrides: &LimitOverrides,
    default: &ResourceLimits,
    minimum: &ResourceLimits,
    maximum: &ResourceLimits,
) -> Result<ResourceLimits> {
    let limiter = ResourceLimiter::new(&LimitPolicy {
        maximum: maximum.clone(),
        minimum: minimum.clone(),
        default: default.clone(),
    })?;
    Ok(limiter.effective(overrides).limits)
}

fn clamp_field<T: Ord + Copy>(
    name: &'static str,
    requested: T,
    min: T,
    max: T,
    clamped: &mut Vec<&'static str>,
) -> T {
    let value = requested.clamp(min, max);
    if value != requested {
        clamped.push(name);
    }
    value
}

fn check_bounds(min: &ResourceLimits, max: &ResourceLimits) -> Result<()> {
    let pairs: [(&str, u64, u64); 6] = [
        ("cpu_time_ms", min.cpu_time_ms, max.cpu_time_ms),
        ("wall_time_ms", min.wall_time_ms, max.wall_time_ms),
        ("memory_bytes", min.memory_bytes, max.memory_bytes),
        ("output_bytes", min.output_bytes, max.output_bytes),
        (
            "process_count",
            u64::from(min.process_count),
            u64::from(max.process_count),
        ),
        ("disk_bytes", min.disk_bytes, max.disk_bytes),
    ];
    for (name, lo, hi) in pairs {
        if lo > hi {
            return Err(SandboxError::InvalidLimits(format!(
                "{name}: minimum {lo} exceeds maximum {hi}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> ResourceLimiter {
        ResourceLimiter::new(&LimitPolicy::default()).unwrap()
    }

    #[test]
    fn no_overrides_yields_defaults() {
        let eff = limiter().effective(&LimitOverrides::default());
        assert_eq!(eff.limits, ResourceLimits::default());
        assert!(eff.clamped.is_empty());
    }

    #[test]
    fn overrides_above_maximum_are_clamped_down() {
        let eff = limiter().effective(&LimitOverrides {
            memory_bytes: Some(64 * 1024 * 1024 * 1024),
            wall_time_ms: Some(3_600_000),
            ..Default::default()
        });
        assert_eq!(eff.limits.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(eff.limits.wall_time_ms, 60_000);
        assert_eq!(eff.clamped, vec!["wall_time_ms", "memory_bytes"]);
    }

    #[test]
    fn overrides_below_minimum_are_raised() {
        let eff = limiter().effective(&LimitOverrides {
            wall_time_ms: Some(1),
            output_bytes: Some(10),
            ..Default::default()
        });
        assert_eq!(eff.limits.wall_time_ms, 100);
        assert_eq!(eff.limits.output_bytes, 1024);
    }

    #[test]
    fn in_range_overrides_pass_through() {
        let eff = limiter().effective(&LimitOverrides {
            wall_time_ms: Some(2_000),
            process_count: Some(4),
            ..Default::default()
        });
        assert_eq!(eff.limits.wall_time_ms, 2_000);
        assert_eq!(eff.limits.process_count, 4);
        assert!(eff.clamped.is_empty());
    }

    #[test]
    fn inverted_bounds_are_invalid_limits() {
        let mut policy = LimitPolicy::default();
        policy.minimum.process_count = 100;
        let err = ResourceLimiter::new(&policy).unwrap_err();
        assert!(matches!(err, SandboxError::InvalidLimits(ref m) if m.contains("process_count")));
    }

    #[test]
    fn default_outside_bounds_is_clamped() {
        let mut policy = LimitPolicy::default();
        policy.default.memory_bytes = policy.maximum.memory_bytes * 2;
        let limiter = ResourceLimiter::new(&policy).unwrap();
        assert_eq!(limiter.defaults().memory_bytes, policy.maximum.memory_bytes);
    }

    #[test]
    fn free_function_matches_limiter() {
        let policy = LimitPolicy::default();
        let overrides = LimitOverrides {
            cpu_time_ms: Some(5),
            ..Default::default()
        };
        let eff = effective_limits(&overrides, &policy.default, &policy.minimum, &policy.maximum)
            .unwrap();
        assert_eq!(eff.cpu_time_ms, 100);
    }
}
