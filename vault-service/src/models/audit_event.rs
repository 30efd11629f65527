//! Audit event model - security and compliance logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ApproleCreated,
    ApproleDeleted,
    ApproleSecretRotated,
    ApproleLoginSuccess,
    ApproleLoginFailure,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::ApproleCreated => "approle_created",
            AuditEventType::ApproleDeleted => "approle_deleted",
            AuditEventType::ApproleSecretRotated => "approle_secret_rotated",
            AuditEventType::ApproleLoginSuccess => "approle_login_success",
            AuditEventType::ApproleLoginFailure => "approle_login_failure",
        }
    }

    /// Whether the event records a granted operation.
    pub fn is_success(&self) -> bool {
        !matches!(self, AuditEventType::ApproleLoginFailure)
    }
}

/// Who performed the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    Admin,
    Approle,
    Agent,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Admin => "admin",
            ActorType::Approle => "approle",
            ActorType::Agent => "agent",
            ActorType::System => "system",
        }
    }
}

/// Actor and correlation details attached to every audit record.
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl AuditContext {
    pub fn admin(correlation_id: Option<String>) -> Self {
        Self {
            actor_type: ActorType::Admin,
            actor_id: None,
            correlation_id,
        }
    }

    /// Context for a login submitted over HTTP.
    pub fn approle(correlation_id: Option<String>) -> Self {
        Self {
            actor_type: ActorType::Approle,
            actor_id: None,
            correlation_id,
        }
    }

    /// Context for a login arriving over an agent session.
    pub fn session(session_id: Uuid) -> Self {
        Self {
            actor_type: ActorType::Agent,
            actor_id: None,
            correlation_id: Some(session_id.to_string()),
        }
    }

    pub fn system() -> Self {
        Self {
            actor_type: ActorType::System,
            actor_id: None,
            correlation_id: None,
        }
    }

    pub fn with_actor_id(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Audit event entity. Write-once.
#[derive(Debug, Clone, FromRow)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub sequence_number: i64,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub event_data: serde_json::Value,
    pub access_granted: bool,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        sequence_number: i64,
        event_type: AuditEventType,
        context: &AuditContext,
        event_data: serde_json::Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence_number,
            event_type: event_type.as_str().to_string(),
            actor_type: context.actor_type.as_str().to_string(),
            actor_id: context.actor_id.clone(),
            event_data,
            access_granted: event_type.is_success(),
            correlation_id: context.correlation_id.clone(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_granted_follows_event_type() {
        let ctx = AuditContext::system();
        let ok = AuditEvent::new(1, AuditEventType::ApproleLoginSuccess, &ctx, serde_json::json!({}));
        let failed =
            AuditEvent::new(2, AuditEventType::ApproleLoginFailure, &ctx, serde_json::json!({}));

        assert!(ok.access_granted);
        assert!(!failed.access_granted);
        assert_eq!(failed.event_type, "approle_login_failure");
    }

    #[test]
    fn session_context_correlates_by_session_id() {
        let session_id = Uuid::new_v4();
        let ctx = AuditContext::session(session_id).with_actor_id("role-1");
        let event = AuditEvent::new(7, AuditEventType::ApproleLoginSuccess, &ctx, serde_json::json!({}));

        assert_eq!(event.actor_type, "agent");
        assert_eq!(event.actor_id.as_deref(), Some("role-1"));
        assert_eq!(event.correlation_id, Some(session_id.to_string()));
        assert_eq!(event.sequence_number, 7);
    }
}
