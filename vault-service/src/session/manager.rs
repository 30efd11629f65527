//! Per-connection session state machine.
//!
//! A `SessionManager` is owned by exactly one connection task. Handlers never
//! panic and never terminate the session; only a missed heartbeat does.

use chrono::Utc;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::instrument;
use uuid::Uuid;

use super::csr::validate_csr;
use super::protocol::{
    AliveReply, AuthenticatedReply, CertificateReply, ErrorReason, InboundFrame, OutboundFrame,
    RenewedReply, ReplyPayload, EVENT_AUTHENTICATE, EVENT_CERTIFICATE_REQUEST, EVENT_HEARTBEAT,
    EVENT_SECRET_RENEW, EVENT_SECRET_REQUEST,
};
use super::state::{AgentIdentity, HeartbeatStatus, SessionState};
use crate::models::AuditContext;
use crate::services::collaborators::{AgentRegistration, CollaboratorError, Collaborators};
use crate::services::AppRoleService;

const MAX_SECRET_PATH_LEN: usize = 512;
const MAX_LEASE_ID_LEN: usize = 256;
const MAX_CREDENTIAL_LEN: usize = 512;

#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum SessionError {
    #[error("invalid payload")]
    Validation(ErrorReason),

    #[error("invalid credentials")]
    Authentication,

    #[error("not authorized")]
    Authorization(ErrorReason),

    #[error("not found")]
    NotFound(ErrorReason),

    #[error("external dependency failed")]
    ExternalDependency(ErrorReason),

    #[error("protocol error")]
    Protocol(ErrorReason),
}

impl SessionError {
    pub fn reason(&self) -> ErrorReason {
        match self {
            SessionError::Authentication => ErrorReason::InvalidCredentials,
            SessionError::Validation(reason)
            | SessionError::Authorization(reason)
            | SessionError::NotFound(reason)
            | SessionError::ExternalDependency(reason)
            | SessionError::Protocol(reason) => *reason,
        }
    }
}

#[derive(Deserialize)]
struct AuthenticatePayload {
    role_id: Option<String>,
    secret_id: Option<String>,
}

#[derive(Deserialize)]
struct SecretRequestPayload {
    path: Option<String>,
}

#[derive(Deserialize)]
struct RenewPayload {
    lease_id: Option<String>,
}

#[derive(Deserialize)]
struct CertificatePayload {
    csr: Option<String>,
}

/// Deserialize an event payload, collapsing any shape error to `reason`.
fn parse_payload<T: for<'de> Deserialize<'de>>(
    payload: &serde_json::Value,
    reason: ErrorReason,
) -> Result<T, SessionError> {
    T::deserialize(payload).map_err(|_| SessionError::Validation(reason))
}

fn required(value: Option<String>, max_len: usize, reason: ErrorReason) -> Result<String, SessionError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() && v.len() <= max_len => Ok(v),
        _ => Err(SessionError::Validation(reason)),
    }
}

fn is_valid_secret_path(path: &str) -> bool {
    !path.starts_with('/')
        && !path.ends_with('/')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && !path
            .chars()
            .any(|c| c.is_control() || matches!(c, '?' | '#' | '%' | '\\'))
}

/// Lease ids are opaque tokens: ASCII alphanumerics plus `-`, `_`, `.` and `:`.
fn is_valid_lease_id(lease_id: &str) -> bool {
    lease_id != "."
        && lease_id != ".."
        && lease_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

pub struct SessionManager {
    session_id: Uuid,
    state: SessionState,
    last_heartbeat: Instant,
    heartbeat_timeout: Duration,
    source_ip: IpAddr,
    approle: AppRoleService,
    collaborators: Collaborators,
}

impl SessionManager {
    /// Open an unauthenticated session.
    pub fn join(
        source_ip: IpAddr,
        heartbeat_timeout: Duration,
        approle: AppRoleService,
        collaborators: Collaborators,
    ) -> Self {
        let session_id = Uuid::new_v4();
        tracing::info!(session_id = %session_id, source_ip = %source_ip, "Agent session joined");
        Self {
            session_id,
            state: SessionState::Joined,
            last_heartbeat: Instant::now(),
            heartbeat_timeout,
            source_ip,
            approle,
            collaborators,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, SessionState::Authenticated(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state, SessionState::Terminated)
    }

    pub fn identity(&self) -> Option<&AgentIdentity> {
        self.state.identity()
    }

    /// Handle a raw text frame. Unparsable frames get an `invalid_frame` reply.
    pub async fn handle_text(&mut self, text: &str) -> OutboundFrame {
        match serde_json::from_str::<InboundFrame>(text) {
            Ok(frame) => self.handle(frame).await,
            Err(e) => {
                tracing::debug!(session_id = %self.session_id, error = %e, "Unparsable frame");
                OutboundFrame::error(None, ErrorReason::InvalidFrame)
            }
        }
    }

    pub async fn handle(&mut self, frame: InboundFrame) -> OutboundFrame {
        let InboundFrame {
            event,
            reference,
            payload,
        } = frame;

        if self.is_terminated() {
            return OutboundFrame::error(reference, ErrorReason::SessionTerminated);
        }

        let result = match event.as_str() {
            EVENT_AUTHENTICATE => self.authenticate(&payload).await,
            EVENT_SECRET_REQUEST => self.request_secret(&payload).await,
            EVENT_HEARTBEAT => self.heartbeat().await,
            EVENT_SECRET_RENEW => self.renew_lease(&payload).await,
            EVENT_CERTIFICATE_REQUEST => self.request_certificate(&payload).await,
            other => {
                tracing::debug!(session_id = %self.session_id, event = %other, "Unknown event");
                Err(SessionError::Protocol(ErrorReason::UnknownEvent))
            }
        };

        match result {
            Ok(payload) => OutboundFrame::ok(reference, payload),
            Err(e) => OutboundFrame::error(reference, e.reason()),
        }
    }

    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn authenticate(
        &mut self,
        payload: &serde_json::Value,
    ) -> Result<ReplyPayload, SessionError> {
        let reason = ErrorReason::InvalidAuthenticationPayload;
        let parsed: AuthenticatePayload = parse_payload(payload, reason)?;
        let role_id = required(parsed.role_id, MAX_CREDENTIAL_LEN, reason)?;
        let secret_id = required(parsed.secret_id, MAX_CREDENTIAL_LEN, reason)?;

        let login = self
            .approle
            .login(
                &role_id,
                &secret_id,
                self.source_ip,
                &AuditContext::session(self.session_id),
            )
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Session authentication failed");
                SessionError::Authentication
            })?;

        let registration = AgentRegistration {
            role_id: login.role_id,
            role_name: login.role_name.clone(),
            policies: login.policies.clone(),
        };
        let agent_id = self
            .collaborators
            .agents
            .bootstrap(&registration)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, role_id = %login.role_id, "Agent registration failed");
                SessionError::ExternalDependency(ErrorReason::AgentRegistrationFailed)
            })?;

        if let Some(previous) = self.identity() {
            let previous_agent = previous.agent_id.clone();
            self.notify_disconnected(&previous_agent).await;
        }

        tracing::info!(agent_id = %agent_id, role_name = %login.role_name, "Agent authenticated");
        self.state = SessionState::Authenticated(AgentIdentity {
            agent_id: agent_id.clone(),
            role_id: login.role_id,
            role_name: login.role_name.clone(),
            policies: login.policies.clone(),
        });
        self.last_heartbeat = Instant::now();

        Ok(ReplyPayload::Authenticated(AuthenticatedReply {
            status: "authenticated",
            agent_id,
            role_name: login.role_name,
            policies: login.policies,
            token: login.token,
        }))
    }

    pub async fn request_secret(
        &mut self,
        payload: &serde_json::Value,
    ) -> Result<ReplyPayload, SessionError> {
        let agent_id = self.require_agent()?;

        let reason = ErrorReason::InvalidSecretPayload;
        let parsed: SecretRequestPayload = parse_payload(payload, reason)?;
        let path = required(parsed.path, MAX_SECRET_PATH_LEN, reason)?;
        if !is_valid_secret_path(&path) {
            return Err(SessionError::Validation(reason));
        }

        let secret = self
            .collaborators
            .secrets
            .read(&agent_id, &path)
            .await
            .map_err(|e| match e {
                CollaboratorError::NotFound => SessionError::NotFound(ErrorReason::SecretNotFound),
                CollaboratorError::Denied => SessionError::Authorization(ErrorReason::AccessDenied),
                other => {
                    tracing::error!(agent_id = %agent_id, path = %path, error = %other, "Secret access failed");
                    SessionError::ExternalDependency(ErrorReason::SecretAccessUnavailable)
                }
            })?;

        tracing::info!(agent_id = %agent_id, path = %path, lease_id = %secret.lease_id, "Secret issued");
        Ok(ReplyPayload::Secret(secret))
    }

    pub async fn heartbeat(&mut self) -> Result<ReplyPayload, SessionError> {
        let agent_id = self.require_agent()?;
        self.last_heartbeat = Instant::now();

        if let Err(e) = self.collaborators.agents.touch_heartbeat(&agent_id).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "Agent directory heartbeat update failed");
        }

        Ok(ReplyPayload::Alive(AliveReply {
            status: "alive",
            timestamp: Utc::now(),
        }))
    }

    pub async fn renew_lease(
        &mut self,
        payload: &serde_json::Value,
    ) -> Result<ReplyPayload, SessionError> {
        let agent_id = self.require_agent()?;

        let reason = ErrorReason::InvalidLeasePayload;
        let parsed: RenewPayload = parse_payload(payload, reason)?;
        let lease_id = required(parsed.lease_id, MAX_LEASE_ID_LEN, reason)?;
        if !is_valid_lease_id(&lease_id) {
            return Err(SessionError::Validation(reason));
        }

        let renewal = self
            .collaborators
            .leases
            .renew(&lease_id, &agent_id)
            .await
            .map_err(|e| match e {
                CollaboratorError::NotFound => SessionError::NotFound(ErrorReason::LeaseNotFound),
                CollaboratorError::NotOwned | CollaboratorError::Denied => {
                    SessionError::Authorization(ErrorReason::LeaseNotOwned)
                }
                CollaboratorError::NotRenewable => {
                    SessionError::Validation(ErrorReason::LeaseNotRenewable)
                }
                CollaboratorError::Expired => SessionError::Validation(ErrorReason::LeaseExpired),
                other => {
                    tracing::error!(agent_id = %agent_id, lease_id = %lease_id, error = %other, "Lease renewal failed");
                    SessionError::ExternalDependency(ErrorReason::LeaseStoreUnavailable)
                }
            })?;

        Ok(ReplyPayload::Renewed(RenewedReply {
            lease_id: renewal.lease_id,
            renewed: true,
            lease_duration: renewal.lease_duration,
        }))
    }

    pub async fn request_certificate(
        &mut self,
        payload: &serde_json::Value,
    ) -> Result<ReplyPayload, SessionError> {
        let agent_id = self.require_agent()?;

        let reason = ErrorReason::InvalidCsrPayload;
        let parsed: CertificatePayload = parse_payload(payload, reason)?;
        let csr = parsed
            .csr
            .as_deref()
            .and_then(validate_csr)
            .ok_or(SessionError::Validation(reason))?;

        let signed = self
            .collaborators
            .ca
            .sign(csr, &agent_id)
            .await
            .map_err(|e| {
                tracing::error!(agent_id = %agent_id, error = %e, "Certificate signing failed");
                SessionError::ExternalDependency(ErrorReason::CertificateSigningFailed)
            })?;

        tracing::info!(agent_id = %agent_id, valid_until = %signed.valid_until, "Certificate issued");
        Ok(ReplyPayload::Certificate(CertificateReply {
            certificate: signed.certificate,
            ca_chain: signed.ca_chain,
            valid_until: signed.valid_until,
        }))
    }

    /// Compare the last heartbeat against the window at `now`.
    pub fn check_heartbeat(&self, now: Instant) -> HeartbeatStatus {
        if !self.is_authenticated() {
            return HeartbeatStatus::Exempt;
        }
        if now.saturating_duration_since(self.last_heartbeat) > self.heartbeat_timeout {
            HeartbeatStatus::Expired
        } else {
            HeartbeatStatus::Alive
        }
    }

    /// Close the session, releasing the agent in the directory. Idempotent.
    pub async fn terminate(&mut self) {
        let previous = std::mem::replace(&mut self.state, SessionState::Terminated);
        match previous {
            SessionState::Authenticated(identity) => {
                self.notify_disconnected(&identity.agent_id).await;
                tracing::info!(
                    session_id = %self.session_id,
                    agent_id = %identity.agent_id,
                    role_id = %identity.role_id,
                    role_name = %identity.role_name,
                    policies = ?identity.policies,
                    "Agent session terminated"
                );
            }
            SessionState::Joined => {
                tracing::info!(session_id = %self.session_id, "Unauthenticated session closed");
            }
            SessionState::Terminated => {}
        }
    }

    fn require_agent(&self) -> Result<String, SessionError> {
        self.identity()
            .map(|identity| identity.agent_id.clone())
            .ok_or(SessionError::Authorization(ErrorReason::NotAuthenticated))
    }

    async fn notify_disconnected(&self, agent_id: &str) {
        if let Err(e) = self.collaborators.agents.mark_disconnected(agent_id).await {
            tracing::warn!(agent_id = %agent_id, error = %e, "Failed to mark agent disconnected");
        }
    }
}
