//! Cgroup resource governance
//!
//! Per-context cgroup v2 groups for limit enforcement and breach evidence.

pub mod v2;

pub use v2::{unified_hierarchy_available, CgroupCounters, CgroupV2, ContextCgroup};
