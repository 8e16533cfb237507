//! Testing infrastructure
//!
//! A scripted isolation backend for exercising the pool and pipeline without
//! spawning real compilers.

pub mod scripted;

pub use scripted::ScriptedBackend;
