//! Audit logging for crypto token lifecycle operations.
//!
//! Activation, deactivation, key generation and key destruction change what
//! a worker can sign, so each of them produces an [`AuditEvent`] recording
//! who acted, on which worker, when, and with what outcome. A rejected
//! activation secret is recorded as a failed `activate_token` event.
//!
//! # Architecture
//!
//! The [`AuditLogger`] trait enables different audit backends:
//!
//! - [`TracingAuditLogger`]: Emits structured `tracing` events at INFO, suitable for log
//!   aggregation and SIEM integration.
//! - [`NoopAuditLogger`]: Discards events.
//!
//! # Usage
//!
//! ```no_run
//! use signet_worker::audit::{
//!     AuditAction, AuditEvent, AuditLogger, AuditResult, TracingAuditLogger, worker_resource,
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let logger = TracingAuditLogger;
//! let event = AuditEvent::builder()
//!     .actor("operator@example.com")
//!     .action(AuditAction::ActivateToken)
//!     .resource(worker_resource(5802))
//!     .result(AuditResult::Success)
//!     .build();
//! logger.log(&event).await;
//! # });
//! ```

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Actor recorded for operations the worker performs on its own behalf,
/// such as automatic activation after a reload.
pub const SYSTEM_ACTOR: &str = "system";

/// Action performed on a crypto token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    /// The token was activated (or activation was attempted).
    ActivateToken,
    /// The token was deactivated.
    DeactivateToken,
    /// New key material was provisioned.
    GenerateKey,
    /// Key material was destroyed.
    DestroyKey,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActivateToken => write!(f, "activate_token"),
            Self::DeactivateToken => write!(f, "deactivate_token"),
            Self::GenerateKey => write!(f, "generate_key"),
            Self::DestroyKey => write!(f, "destroy_key"),
        }
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditResult {
    /// Operation completed successfully.
    Success,
    /// Operation failed with the given reason.
    Failure(String),
}

impl fmt::Display for AuditResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(reason) => write!(f, "failure: {reason}"),
        }
    }
}

/// Structured audit event for token lifecycle operations.
#[derive(Debug, Clone, bon::Builder)]
pub struct AuditEvent {
    /// When the event occurred (defaults to now).
    #[builder(default = Utc::now())]
    pub timestamp: DateTime<Utc>,
    /// Identity of the actor performing the operation.
    #[builder(into)]
    pub actor: String,
    /// The action that was performed.
    pub action: AuditAction,
    /// Resource identifier (e.g., "worker:5802").
    #[builder(into)]
    pub resource: String,
    /// Outcome of the operation.
    pub result: AuditResult,
    /// Additional context (e.g., token kind, key fingerprint).
    #[builder(default)]
    pub metadata: HashMap<String, String>,
}

/// Trait for audit log backends.
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// Records an audit event.
    ///
    /// Implementations should not fail silently; delivery failures should
    /// be surfaced through the observability stack.
    async fn log(&self, event: &AuditEvent);
}

#[async_trait]
impl<L: AuditLogger> AuditLogger for std::sync::Arc<L> {
    async fn log(&self, event: &AuditEvent) {
        (**self).log(event).await;
    }
}

/// Audit logger that emits structured `tracing` events.
///
/// Field mapping:
/// - `audit.timestamp`: ISO 8601 timestamp
/// - `audit.actor`: who performed the action
/// - `audit.action`: the operation (e.g., "activate_token")
/// - `audit.resource`: the affected worker
/// - `audit.result`: "success" or "failure: ..."
/// - `audit.metadata`: additional context
#[derive(Debug, Clone, Copy)]
pub struct TracingAuditLogger;

#[async_trait]
impl AuditLogger for TracingAuditLogger {
    async fn log(&self, event: &AuditEvent) {
        let metadata_str = if event.metadata.is_empty() {
            String::new()
        } else {
            let mut pairs: Vec<_> =
                event.metadata.iter().map(|(k, v)| format!("{k}={v}")).collect();
            pairs.sort();
            pairs.join(", ")
        };

        tracing::info!(
            audit.timestamp = %event.timestamp.to_rfc3339(),
            audit.actor = %event.actor,
            audit.action = %event.action,
            audit.resource = %event.resource,
            audit.result = %event.result,
            audit.metadata = %metadata_str,
            "audit_event"
        );
    }
}

/// No-op audit logger for testing and environments where audit is not needed.
#[derive(Debug, Clone, Copy)]
pub struct NoopAuditLogger;

#[async_trait]
impl AuditLogger for NoopAuditLogger {
    async fn log(&self, _event: &AuditEvent) {}
}

/// Constructs a resource identifier string for a worker.
pub fn worker_resource(worker_id: impl fmt::Display) -> String {
    format!("worker:{worker_id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[test]
    fn test_audit_action_display() {
        assert_eq!(AuditAction::ActivateToken.to_string(), "activate_token");
        assert_eq!(AuditAction::DeactivateToken.to_string(), "deactivate_token");
        assert_eq!(AuditAction::GenerateKey.to_string(), "generate_key");
        assert_eq!(AuditAction::DestroyKey.to_string(), "destroy_key");
    }

    #[test]
    fn test_audit_result_display() {
        assert_eq!(AuditResult::Success.to_string(), "success");
        assert_eq!(
            AuditResult::Failure("wrong activation secret".to_owned()).to_string(),
            "failure: wrong activation secret"
        );
    }

    #[test]
    fn test_audit_event_builder_defaults() {
        let event = AuditEvent::builder()
            .actor(SYSTEM_ACTOR)
            .action(AuditAction::ActivateToken)
            .resource(worker_resource(7))
            .result(AuditResult::Success)
            .build();

        assert_eq!(event.actor, "system");
        assert_eq!(event.resource, "worker:7");
        assert!(event.metadata.is_empty());
        let diff = Utc::now() - event.timestamp;
        assert!(diff.num_seconds() < 2);
    }

    #[tokio::test]
    async fn test_tracing_audit_logger_emits_event() {
        let subscriber = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_test_writer());
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut metadata = HashMap::new();
        metadata.insert("token".to_owned(), "software".to_owned());

        let event = AuditEvent::builder()
            .actor("operator")
            .action(AuditAction::DestroyKey)
            .resource(worker_resource(1))
            .result(AuditResult::Success)
            .metadata(metadata)
            .build();

        TracingAuditLogger.log(&event).await;
    }

    #[tokio::test]
    async fn test_noop_audit_logger() {
        let event = AuditEvent::builder()
            .actor("test")
            .action(AuditAction::GenerateKey)
            .resource(worker_resource(1))
            .result(AuditResult::Failure("module unreachable".to_owned()))
            .build();

        NoopAuditLogger.log(&event).await;
    }
}
