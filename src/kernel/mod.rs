//! Thin wrappers around Linux kernel primitives.
//!
//! `unsafe` code is concentrated here and in `safety::cleanup`.

pub mod cgroup;
pub mod mount;
pub mod namespace;
pub mod rlimits;
pub mod signal;
