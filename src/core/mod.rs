//! Sandbox runtime core
//!
//! Backend abstraction, the isolated environment handle and the pool that
//! owns environments between requests.

pub mod backend;
pub mod environment;
pub mod pool;

pub use backend::{CommandLimits, CommandSpec, ContextHandle, IsolationBackend, RawRun};
pub use environment::{EnvironmentState, IsolatedEnvironment, RunReport, RunStatus};
pub use pool::{EnvironmentLease, EnvironmentPool, PoolSettings, PoolStats, ShutdownReport};
