//! JSON frames exchanged with agents over the socket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::collaborators::SecretPayload;

/// The only topic an agent may join. Identity is established afterwards.
pub const LOBBY_TOPIC: &str = "agent:lobby";

pub const EVENT_AUTHENTICATE: &str = "authenticate";
pub const EVENT_SECRET_REQUEST: &str = "secret:request";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_SECRET_RENEW: &str = "secret:renew";
pub const EVENT_CERTIFICATE_REQUEST: &str = "certificate:request";

/// Client to server frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub event: String,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Server to client frame.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutboundFrame {
    Reply {
        #[serde(rename = "ref")]
        reference: Option<String>,
        status: ReplyStatus,
        response: ReplyBody,
    },
    Disconnect {
        payload: DisconnectPayload,
    },
}

impl OutboundFrame {
    pub fn ok(reference: Option<String>, payload: ReplyPayload) -> Self {
        OutboundFrame::Reply {
            reference,
            status: ReplyStatus::Ok,
            response: ReplyBody::Ok(payload),
        }
    }

    pub fn error(reference: Option<String>, reason: ErrorReason) -> Self {
        OutboundFrame::Reply {
            reference,
            status: ReplyStatus::Error,
            response: ReplyBody::Error { reason },
        }
    }

    pub fn heartbeat_timeout() -> Self {
        OutboundFrame::Disconnect {
            payload: DisconnectPayload {
                reason: DisconnectReason::HeartbeatTimeout,
            },
        }
    }

    /// Error reason carried by an error reply, if this is one.
    pub fn error_reason(&self) -> Option<ErrorReason> {
        match self {
            OutboundFrame::Reply {
                response: ReplyBody::Error { reason },
                ..
            } => Some(*reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyBody {
    Ok(ReplyPayload),
    Error { reason: ErrorReason },
}

/// Successful responses, one per event.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ReplyPayload {
    Authenticated(AuthenticatedReply),
    Secret(SecretPayload),
    Alive(AliveReply),
    Renewed(RenewedReply),
    Certificate(CertificateReply),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedReply {
    pub status: &'static str,
    pub agent_id: String,
    pub role_name: String,
    pub policies: Vec<String>,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AliveReply {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RenewedReply {
    pub lease_id: String,
    pub renewed: bool,
    pub lease_duration: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateReply {
    pub certificate: String,
    pub ca_chain: Vec<String>,
    pub valid_until: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DisconnectPayload {
    pub reason: DisconnectReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    HeartbeatTimeout,
}

/// Stable reason codes sent in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    InvalidAuthenticationPayload,
    InvalidCredentials,
    AgentRegistrationFailed,
    NotAuthenticated,
    InvalidSecretPayload,
    SecretNotFound,
    AccessDenied,
    SecretAccessUnavailable,
    InvalidLeasePayload,
    LeaseNotFound,
    LeaseNotOwned,
    LeaseNotRenewable,
    LeaseExpired,
    LeaseStoreUnavailable,
    InvalidCsrPayload,
    CertificateSigningFailed,
    UnknownEvent,
    InvalidFrame,
    SessionTerminated,
}
