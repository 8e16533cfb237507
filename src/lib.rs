//! boltbox: sandboxed compile-and-run service for untrusted Rust source
//!
//! Requests are served from a pool of reusable isolated environments. Each
//! environment is a private working directory backed by a cgroup, and every
//! command inside it runs in its own process group under rlimits.
//!
//! # Architecture
//!
//! ## Request Path
//! - [`dispatcher`]: validation, limit resolution, lease and release
//! - [`judge`]: compile/run/disassemble pipeline and the `rustc` toolchain
//! - [`core::pool`]: bounded pool of reusable environments
//! - [`core::environment`]: environment handle and its lifecycle states
//!
//! ## Isolation ([`backend`], [`kernel`])
//! - [`backend::process`]: process-group backend with cgroup v2 accounting
//! - [`kernel::cgroup`]: cgroup v2 controller access
//! - [`kernel::rlimits`]: per-command rlimits applied before exec
//! - [`kernel::namespace`]: network namespace isolation
//! - [`kernel::signal`]: shutdown flags and process-group termination
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: request/result data model and error taxonomy
//! - [`config::service`]: service configuration file
//! - [`config::limiter`]: clamping of requested limits
//! - [`config::validator`]: startup validation
//!
//! ## Support
//! - [`safety`]: path confinement and symlink-safe cleanup
//! - [`utils::output`]: bounded output capture
//! - [`observability`]: audit events and metrics
//! - [`testing`]: scripted backend for tests

// Kernel primitives
pub mod kernel;

// Isolation backends
pub mod backend;

// Environments and the pool
pub mod core;

// Compile/run/disassemble pipeline
pub mod judge;

// Public entry point
pub mod dispatcher;

// Safety & cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration & policy
pub mod config;

// Utilities
pub mod utils;

// Testing infrastructure
pub mod testing;

// CLI entrypoint for the boltbox binary
pub mod cli;

pub use config::service::ServiceConfig;
pub use config::types::*;
pub use dispatcher::Dispatcher;
