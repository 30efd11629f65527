//! AppRole engine: role lifecycle and secret-zero login.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde_json::json;
use std::net::IpAddr;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::cidr::ip_allowed;
use super::error::ServiceError;
use super::role_store::RoleStore;
use super::token::{IssuedToken, TokenService};
use super::AuditService;
use crate::models::{AuditContext, AuditEventType, Role, RoleMetadata, RoleOptions};

/// Compared against when there is no stored digest, so unknown roles cost the
/// same as a wrong secret.
const PLACEHOLDER_DIGEST: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Lost conditional updates before a login is given up.
const MAX_CONSUME_ATTEMPTS: usize = 3;

const SECRET_ID_BYTES: usize = 32;

/// Why a login was refused. Recorded in the audit trail only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureReason {
    MalformedRoleId,
    RoleNotFound,
    SecretMismatch,
    SecretExpired,
    UsesExhausted,
    CidrMismatch,
    ConcurrentUse,
    TokenIssuanceFailed,
}

impl LoginFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginFailureReason::MalformedRoleId => "malformed_role_id",
            LoginFailureReason::RoleNotFound => "role_not_found",
            LoginFailureReason::SecretMismatch => "secret_id_mismatch",
            LoginFailureReason::SecretExpired => "secret_id_expired",
            LoginFailureReason::UsesExhausted => "secret_id_uses_exhausted",
            LoginFailureReason::CidrMismatch => "source_ip_not_in_bound_cidr",
            LoginFailureReason::ConcurrentUse => "concurrent_use",
            LoginFailureReason::TokenIssuanceFailed => "token_issuance_failed",
        }
    }
}

/// Returned once from `create_role`. The plaintext secret is not kept.
#[derive(Debug, Clone)]
pub struct CreatedRole {
    pub role_id: Uuid,
    pub secret_id: String,
    pub role_name: String,
}

#[derive(Debug, Clone)]
pub struct LoginResult {
    pub token: String,
    pub policies: Vec<String>,
    pub role_name: String,
    pub role_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct AppRoleService {
    store: Arc<dyn RoleStore>,
    tokens: TokenService,
    audit: AuditService,
}

impl AppRoleService {
    pub fn new(store: Arc<dyn RoleStore>, tokens: TokenService, audit: AuditService) -> Self {
        Self {
            store,
            tokens,
            audit,
        }
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub async fn create_role(
        &self,
        role_name: String,
        options: RoleOptions,
        context: &AuditContext,
    ) -> Result<CreatedRole, ServiceError> {
        let secret_id = generate_secret_id();
        let role = Role::new(role_name, &secret_id, options);

        self.store.insert(&role).await?;

        tracing::info!(role_id = %role.role_id, role_name = %role.role_name, "AppRole created");
        self.audit
            .record(
                AuditEventType::ApproleCreated,
                context,
                json!({
                    "role_id": role.role_id,
                    "role_name": role.role_name,
                    "secret_id_ttl": role.secret_id_ttl,
                    "secret_id_num_uses": role.secret_id_num_uses,
                    "bound_cidr_list": role.bound_cidr_list,
                    "policies": role.policies,
                }),
            )
            .await;

        Ok(CreatedRole {
            role_id: role.role_id,
            secret_id,
            role_name: role.role_name,
        })
    }

    /// Exchange a role_id/secret_id pair for a token.
    ///
    /// Every refusal yields `ServiceError::InvalidCredentials`; the cause is
    /// only written to the audit trail.
    pub async fn login(
        &self,
        role_id: &str,
        secret_id: &str,
        source_ip: IpAddr,
        context: &AuditContext,
    ) -> Result<LoginResult, ServiceError> {
        let presented = Role::hash_secret_id(secret_id);

        let Ok(parsed_id) = Uuid::parse_str(role_id.trim()) else {
            digests_match(&presented, PLACEHOLDER_DIGEST);
            return self
                .reject(None, LoginFailureReason::MalformedRoleId, source_ip, context)
                .await;
        };

        for _ in 0..MAX_CONSUME_ATTEMPTS {
            let Some(role) = self.store.find(parsed_id).await? else {
                digests_match(&presented, PLACEHOLDER_DIGEST);
                return self
                    .reject(
                        Some(parsed_id),
                        LoginFailureReason::RoleNotFound,
                        source_ip,
                        context,
                    )
                    .await;
            };

            if let Err(reason) = check_login(&role, &presented, source_ip, Utc::now()) {
                return self.reject(Some(parsed_id), reason, source_ip, context).await;
            }

            // Minted before the use is consumed, so a failure here leaves the
            // secret_id untouched.
            let issued = match self.tokens.issue(&role) {
                Ok(issued) => issued,
                Err(e) => {
                    tracing::error!(role_id = %parsed_id, error = %e, "Token issuance failed");
                    self.record_failure(
                        Some(parsed_id),
                        LoginFailureReason::TokenIssuanceFailed,
                        source_ip,
                        context,
                    )
                    .await;
                    return Err(ServiceError::Token(e));
                }
            };

            // Conditioned on the digest just validated, so a rotation in
            // between makes this write miss.
            if self
                .store
                .consume_secret_id(parsed_id, role.secret_id_uses, &role.secret_id_hash)
                .await?
            {
                return Ok(self.accept(role, issued, source_ip, context).await);
            }

            tracing::debug!(role_id = %parsed_id, "Secret consumption lost a race, re-reading role");
        }

        self.reject(
            Some(parsed_id),
            LoginFailureReason::ConcurrentUse,
            source_ip,
            context,
        )
        .await
    }

    pub async fn rotate_secret_id(
        &self,
        role_id: Uuid,
        context: &AuditContext,
    ) -> Result<String, ServiceError> {
        let secret_id = generate_secret_id();
        let rotated = self
            .store
            .replace_secret_id(role_id, &Role::hash_secret_id(&secret_id), Utc::now())
            .await?;
        if !rotated {
            return Err(ServiceError::RoleNotFound);
        }

        tracing::info!(role_id = %role_id, "AppRole secret_id rotated");
        self.audit
            .record(
                AuditEventType::ApproleSecretRotated,
                context,
                json!({ "role_id": role_id }),
            )
            .await;

        Ok(secret_id)
    }

    pub async fn delete_role(
        &self,
        role_id: Uuid,
        context: &AuditContext,
    ) -> Result<(), ServiceError> {
        if !self.store.delete(role_id).await? {
            return Err(ServiceError::RoleNotFound);
        }

        tracing::info!(role_id = %role_id, "AppRole deleted");
        self.audit
            .record(
                AuditEventType::ApproleDeleted,
                context,
                json!({ "role_id": role_id }),
            )
            .await;
        Ok(())
    }

    pub async fn list_roles(&self) -> Result<Vec<RoleMetadata>, ServiceError> {
        let roles = self.store.list().await?;
        Ok(roles.iter().map(RoleMetadata::from).collect())
    }

    pub async fn get_role(&self, role_id: Uuid) -> Result<RoleMetadata, ServiceError> {
        self.store
            .find(role_id)
            .await?
            .map(|role| RoleMetadata::from(&role))
            .ok_or(ServiceError::RoleNotFound)
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        self.store.health_check().await?;
        Ok(())
    }

    async fn accept(
        &self,
        role: Role,
        issued: IssuedToken,
        source_ip: IpAddr,
        context: &AuditContext,
    ) -> LoginResult {
        tracing::info!(role_id = %role.role_id, role_name = %role.role_name, "AppRole login succeeded");
        self.audit
            .record(
                AuditEventType::ApproleLoginSuccess,
                &context.clone().with_actor_id(role.role_id.to_string()),
                json!({
                    "role_name": role.role_name,
                    "source_ip": source_ip.to_string(),
                    "token_id": issued.claims.jti,
                    "remaining_uses": role.remaining_uses().map(|n| n - 1),
                }),
            )
            .await;

        let expires_at = issued.expires_at();
        LoginResult {
            token: issued.token,
            policies: role.policies,
            role_name: role.role_name,
            role_id: role.role_id,
            expires_at,
        }
    }

    async fn reject<T>(
        &self,
        role_id: Option<Uuid>,
        reason: LoginFailureReason,
        source_ip: IpAddr,
        context: &AuditContext,
    ) -> Result<T, ServiceError> {
        tracing::warn!(
            role_id = ?role_id,
            source_ip = %source_ip,
            "AppRole login rejected"
        );
        self.record_failure(role_id, reason, source_ip, context).await;
        Err(ServiceError::InvalidCredentials)
    }

    async fn record_failure(
        &self,
        role_id: Option<Uuid>,
        reason: LoginFailureReason,
        source_ip: IpAddr,
        context: &AuditContext,
    ) {
        let context = match role_id {
            Some(id) => context.clone().with_actor_id(id.to_string()),
            None => context.clone(),
        };
        self.audit
            .record(
                AuditEventType::ApproleLoginFailure,
                &context,
                json!({
                    "reason": reason.as_str(),
                    "source_ip": source_ip.to_string(),
                }),
            )
            .await;
    }
}

/// Ordered login checks. The first failing check wins.
fn check_login(
    role: &Role,
    presented_digest: &str,
    source_ip: IpAddr,
    now: DateTime<Utc>,
) -> Result<(), LoginFailureReason> {
    if role.bind_secret_id && !digests_match(presented_digest, &role.secret_id_hash) {
        return Err(LoginFailureReason::SecretMismatch);
    }
    if role.is_secret_id_expired(now) {
        return Err(LoginFailureReason::SecretExpired);
    }
    if role.is_secret_id_exhausted() {
        return Err(LoginFailureReason::UsesExhausted);
    }
    if !ip_allowed(&role.bound_cidr_list, source_ip) {
        return Err(LoginFailureReason::CidrMismatch);
    }
    Ok(())
}

fn digests_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

fn generate_secret_id() -> String {
    let mut bytes = [0u8; SECRET_ID_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::audit::InMemoryAuditSink;
    use crate::services::role_store::InMemoryRoleStore;
    use crate::services::token::TokenError;
    use chrono::Duration;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    fn service() -> (AppRoleService, Arc<InMemoryRoleStore>, Arc<InMemoryAuditSink>) {
        let store = Arc::new(InMemoryRoleStore::new());
        let sink = Arc::new(InMemoryAuditSink::new());
        let tokens = TokenService::new(&crate::config::tests::dev_config().token);
        let service = AppRoleService::new(store.clone(), tokens, AuditService::new(sink.clone()));
        (service, store, sink)
    }

    #[test]
    fn secret_ids_are_unique_and_url_safe() {
        let a = generate_secret_id();
        let b = generate_secret_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(a
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn checks_run_in_order() {
        let mut role = Role::new(
            "svc".to_string(),
            "right",
            RoleOptions {
                secret_id_ttl: Some(60),
                bound_cidr_list: vec!["10.0.0.0/8".to_string()],
                ..Default::default()
            },
        );
        role.secret_id_uses = 1;
        let later = role.secret_id_created_at + Duration::seconds(120);
        let wrong = Role::hash_secret_id("wrong");
        let right = Role::hash_secret_id("right");

        // Everything is wrong: the secret check reports first.
        assert_eq!(
            check_login(&role, &wrong, localhost(), later),
            Err(LoginFailureReason::SecretMismatch)
        );
        assert_eq!(
            check_login(&role, &right, localhost(), later),
            Err(LoginFailureReason::SecretExpired)
        );
        assert_eq!(
            check_login(&role, &right, localhost(), role.secret_id_created_at),
            Err(LoginFailureReason::UsesExhausted)
        );
        role.secret_id_uses = 0;
        assert_eq!(
            check_login(&role, &right, localhost(), role.secret_id_created_at),
            Err(LoginFailureReason::CidrMismatch)
        );
        assert_eq!(
            check_login(
                &role,
                &right,
                "10.1.2.3".parse().unwrap(),
                role.secret_id_created_at
            ),
            Ok(())
        );
    }

    #[test]
    fn unbound_secret_is_not_compared() {
        let role = Role::new(
            "svc".to_string(),
            "right",
            RoleOptions {
                bind_secret_id: Some(false),
                ..Default::default()
            },
        );
        assert_eq!(
            check_login(
                &role,
                &Role::hash_secret_id("anything"),
                localhost(),
                role.secret_id_created_at
            ),
            Ok(())
        );
    }

    #[tokio::test]
    async fn failure_reason_only_in_audit() {
        let (service, _, sink) = service();
        let created = service
            .create_role("svc".to_string(), RoleOptions::default(), &AuditContext::system())
            .await
            .unwrap();

        let err = service
            .login(
                &created.role_id.to_string(),
                "wrong",
                localhost(),
                &AuditContext::system(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));

        let failures = sink.events_of(AuditEventType::ApproleLoginFailure).await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].event_data["reason"], "secret_id_mismatch");
        assert!(!failures[0].access_granted);
    }

    #[tokio::test]
    async fn successful_login_consumes_a_use() {
        let (service, store, sink) = service();
        let created = service
            .create_role(
                "svc".to_string(),
                RoleOptions {
                    secret_id_num_uses: Some(2),
                    policies: vec!["default".to_string()],
                    ..Default::default()
                },
                &AuditContext::system(),
            )
            .await
            .unwrap();

        let result = service
            .login(
                &created.role_id.to_string(),
                &created.secret_id,
                localhost(),
                &AuditContext::system(),
            )
            .await
            .unwrap();

        assert_eq!(result.role_name, "svc");
        assert_eq!(result.policies, vec!["default"]);
        assert!(service.tokens().verify(&result.token).is_ok());

        let role = store.find(created.role_id).await.unwrap().unwrap();
        assert_eq!(role.secret_id_uses, 1);

        let successes = sink.events_of(AuditEventType::ApproleLoginSuccess).await;
        assert_eq!(successes.len(), 1);
        assert_eq!(successes[0].event_data["remaining_uses"], 1);
    }

    #[tokio::test]
    async fn issuance_failure_keeps_the_secret_usable() {
        let store = Arc::new(InMemoryRoleStore::new());
        let sink = Arc::new(InMemoryAuditSink::new());
        let mut config = crate::config::tests::dev_config().token;
        // Past the last representable timestamp.
        config.ttl_seconds = 9_000_000_000_000;
        let broken = AppRoleService::new(
            store.clone(),
            TokenService::new(&config),
            AuditService::new(sink.clone()),
        );

        let created = broken
            .create_role("svc".to_string(), RoleOptions::default(), &AuditContext::system())
            .await
            .unwrap();
        let err = broken
            .login(
                &created.role_id.to_string(),
                &created.secret_id,
                localhost(),
                &AuditContext::system(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Token(TokenError::Lifetime)));

        let role = store.find(created.role_id).await.unwrap().unwrap();
        assert_eq!(role.secret_id_uses, 0);
        assert_eq!(
            sink.events_of(AuditEventType::ApproleLoginFailure).await[0].event_data["reason"],
            "token_issuance_failed"
        );

        // The single-use secret still works once issuance is healthy.
        let healthy = AppRoleService::new(
            store,
            TokenService::new(&crate::config::tests::dev_config().token),
            AuditService::new(sink),
        );
        healthy
            .login(
                &created.role_id.to_string(),
                &created.secret_id,
                localhost(),
                &AuditContext::system(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn malformed_role_id_is_generic_failure() {
        let (service, _, sink) = service();
        let err = service
            .login("not-a-uuid", "x", localhost(), &AuditContext::system())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCredentials));
        assert_eq!(
            sink.events_of(AuditEventType::ApproleLoginFailure).await[0].event_data["reason"],
            "malformed_role_id"
        );
    }

    #[tokio::test]
    async fn rotate_and_delete_unknown_role() {
        let (service, _, _) = service();
        let id = Uuid::new_v4();
        assert!(matches!(
            service.rotate_secret_id(id, &AuditContext::system()).await,
            Err(ServiceError::RoleNotFound)
        ));
        assert!(matches!(
            service.delete_role(id, &AuditContext::system()).await,
            Err(ServiceError::RoleNotFound)
        ));
    }
}
