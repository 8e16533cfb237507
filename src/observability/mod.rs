//! Observability
//!
//! Structured audit events and service metrics.

pub mod audit;
pub mod metrics;
