//! Configuration and policy
//!
//! Data model, service configuration, startup validation and the resource
//! limiter.

pub mod limiter;
pub mod service;
pub mod types;
pub mod validator;
