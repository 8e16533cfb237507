/// Structured audit events for boltbox
///
/// Every event is serialized to one JSON object and emitted through the `log`
/// facade on the `boltbox::audit` target, so operators can route audit
/// records separately with `RUST_LOG=boltbox::audit=info`.
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::types::{LimitBreach, Outcome};

pub const AUDIT_TARGET: &str = "boltbox::audit";

/// Audit event severity levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Kinds of events recorded in the audit trail
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Request lifecycle
    RequestStart,
    RequestEnd,
    RequestRejected,

    // Environment lifecycle
    EnvironmentProvisioned,
    EnvironmentReset,
    EnvironmentDestroyed,
    EnvironmentContaminated,
    ProvisioningFailure,
    DestroyFailure,

    // Enforcement
    LimitViolation,
    WallTimeExceeded,
    ForcedKill,
    PathTraversalAttempt,
    ControlDegraded,
}

impl AuditEventType {
    /// Get the default severity for this event type
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::RequestStart
            | AuditEventType::RequestEnd
            | AuditEventType::EnvironmentProvisioned
            | AuditEventType::EnvironmentReset
            | AuditEventType::EnvironmentDestroyed => AuditSeverity::Low,

            AuditEventType::RequestRejected
            | AuditEventType::EnvironmentContaminated
            | AuditEventType::WallTimeExceeded => AuditSeverity::Medium,

            AuditEventType::LimitViolation
            | AuditEventType::ForcedKill
            | AuditEventType::ControlDegraded => AuditSeverity::High,

            AuditEventType::ProvisioningFailure
            | AuditEventType::DestroyFailure
            | AuditEventType::PathTraversalAttempt => AuditSeverity::Critical,
        }
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breach: Option<LimitBreach>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            details: details.into(),
            request_id: None,
            environment_id: None,
            source_sha256: None,
            outcome: None,
            breach: None,
            elapsed_ms: None,
        }
    }

    pub fn with_request(mut self, request_id: &str) -> Self {
        self.request_id = Some(request_id.to_string());
        self
    }

    pub fn with_environment(mut self, environment_id: &str) -> Self {
        self.environment_id = Some(environment_id.to_string());
        self
    }

    pub fn with_source_digest(mut self, digest: String) -> Self {
        self.source_sha256 = Some(digest);
        self
    }

    pub fn with_outcome(mut self, outcome: Outcome, elapsed_ms: u64) -> Self {
        self.outcome = Some(outcome);
        self.elapsed_ms = Some(elapsed_ms);
        self
    }

    pub fn with_breach(mut self, breach: LimitBreach) -> Self {
        self.breach = Some(breach);
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"event_type\":\"{:?}\",\"serialization_error\":\"{}\"}}",
                self.event_type, e
            )
        })
    }
}

/// Emit an audit event on the audit log target
pub fn emit(event: AuditEvent) {
    let line = event.to_json();
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => error!(target: AUDIT_TARGET, "{}", line),
        AuditSeverity::Medium => warn!(target: AUDIT_TARGET, "{}", line),
        AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", line),
    }
}

/// Convenience functions for common audit events
pub mod events {
    use super::*;

    pub fn request_start(request_id: &str, source_sha256: String, mode: &str) {
        emit(
            AuditEvent::new(AuditEventType::RequestStart, mode)
                .with_request(request_id)
                .with_source_digest(source_sha256),
        );
    }

    pub fn request_end(
        request_id: &str,
        environment_id: Option<&str>,
        outcome: Outcome,
        elapsed_ms: u64,
    ) {
        let mut event = AuditEvent::new(AuditEventType::RequestEnd, outcome.as_str())
            .with_request(request_id)
            .with_outcome(outcome, elapsed_ms);
        if let Some(id) = environment_id {
            event = event.with_environment(id);
        }
        emit(event);
    }

    pub fn request_rejected(request_id: &str, reason: &str) {
        emit(AuditEvent::new(AuditEventType::RequestRejected, reason).with_request(request_id));
    }

    pub fn environment_provisioned(environment_id: &str) {
        emit(
            AuditEvent::new(AuditEventType::EnvironmentProvisioned, "environment ready")
                .with_environment(environment_id),
        );
    }

    pub fn environment_reset(environment_id: &str, use_count: u32) {
        emit(
            AuditEvent::new(
                AuditEventType::EnvironmentReset,
                format!("environment reset after {} uses", use_count),
            )
            .with_environment(environment_id),
        );
    }

    pub fn environment_destroyed(environment_id: &str, reason: &str) {
        emit(
            AuditEvent::new(AuditEventType::EnvironmentDestroyed, reason)
                .with_environment(environment_id),
        );
    }

    pub fn environment_contaminated(environment_id: &str, reason: &str) {
        emit(
            AuditEvent::new(AuditEventType::EnvironmentContaminated, reason)
                .with_environment(environment_id),
        );
    }

    pub fn provisioning_failure(details: &str) {
        emit(AuditEvent::new(AuditEventType::ProvisioningFailure, details));
    }

    pub fn destroy_failure(environment_id: &str, details: &str) {
        emit(
            AuditEvent::new(AuditEventType::DestroyFailure, details)
                .with_environment(environment_id),
        );
    }

    pub fn limit_violation(environment_id: &str, breach: LimitBreach) {
        emit(
            AuditEvent::new(
                AuditEventType::LimitViolation,
                format!("{} limit exceeded", breach),
            )
            .with_environment(environment_id)
            .with_breach(breach),
        );
    }

    pub fn wall_time_exceeded(environment_id: &str, timeout_ms: u64) {
        emit(
            AuditEvent::new(
                AuditEventType::WallTimeExceeded,
                format!("process tree killed after {} ms", timeout_ms),
            )
            .with_environment(environment_id),
        );
    }

    pub fn forced_kill(environment_id: &str, details: &str) {
        emit(AuditEvent::new(AuditEventType::ForcedKill, details).with_environment(environment_id));
    }

    pub fn path_traversal_attempt(environment_id: &str, path: &str) {
        emit(
            AuditEvent::new(
                AuditEventType::PathTraversalAttempt,
                format!("blocked write outside environment root: {}", path),
            )
            .with_environment(environment_id),
        );
    }

    pub fn control_degraded(details: &str) {
        emit(AuditEvent::new(AuditEventType::ControlDegraded, details));
    }
}
