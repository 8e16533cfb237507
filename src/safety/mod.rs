//! Safety & cleanup
//!
//! Path confinement for untrusted file names and symlink-safe tree removal.

pub mod cleanup;
pub mod paths;
