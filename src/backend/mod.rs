//! Isolation backends
//!
//! Implementations of [`crate::core::backend::IsolationBackend`].

pub mod process;

pub use process::ProcessBackend;
