//! Shared setup for vault-service integration tests.
//!
//! Everything runs in-process: roles and audit events live in memory and the
//! collaborators are the in-memory doubles unless a test swaps one out.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::Router;
use secrecy::Secret;
use service_core::config::Config;
use service_core::middleware::rate_limit::{create_ip_rate_limiter, IpRateLimit};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use vault_service::{
    build_router,
    config::{
        CollaboratorConfig, Environment, RateLimitConfig, SecurityConfig, SessionConfig,
        TokenConfig, VaultConfig,
    },
    services::{
        collaborators::{
            AgentRegistration, InMemoryAgentDirectory, InMemoryLeaseStore, InMemorySecretAccess,
            SignedCertificate, StaticCertificateAuthority,
        },
        AgentDirectory, AppRoleService, CertificateAuthority, AuditService, CollaboratorError, Collaborators,
        InMemoryAuditSink, InMemoryRoleStore, TokenService,
    },
    AppState,
};

pub const ADMIN_KEY: &str = "test-admin-key";
pub const SIGNING_KEY: &str = "integration-test-signing-key-0123456789";
pub const CA_VALIDITY_HOURS: i64 = 24;

pub fn client_addr() -> SocketAddr {
    "10.20.30.40:51000".parse().unwrap()
}

pub fn client_ip() -> IpAddr {
    client_addr().ip()
}

pub fn test_config() -> VaultConfig {
    VaultConfig {
        common: Config::default(),
        environment: Environment::Dev,
        service_name: "vault-service".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: None,
        token: TokenConfig {
            signing_key: Secret::new(SIGNING_KEY.to_string()),
            ttl_seconds: 3600,
            issuer: "vault-service-test".to_string(),
        },
        session: SessionConfig {
            heartbeat_timeout_seconds: 90,
            unauthenticated_idle_seconds: 300,
        },
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: Secret::new(ADMIN_KEY.to_string()),
            trust_forwarded_for: false,
        },
        collaborators: CollaboratorConfig {
            agent_directory_url: None,
            secret_access_url: None,
            lease_store_url: None,
            certificate_authority_url: None,
            timeout_seconds: 5,
        },
        rate_limit: RateLimitConfig {
            admin_limit: 1000,
            admin_window_seconds: 60,
            socket_limit: 1000,
            socket_window_seconds: 60,
        },
    }
}

/// Agent directory that is always down.
pub struct FailingAgentDirectory;

#[async_trait]
impl AgentDirectory for FailingAgentDirectory {
    async fn bootstrap(&self, _registration: &AgentRegistration) -> Result<String, CollaboratorError> {
        Err(CollaboratorError::Unavailable("directory offline".to_string()))
    }

    async fn mark_disconnected(&self, _agent_id: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("directory offline".to_string()))
    }

    async fn touch_heartbeat(&self, _agent_id: &str) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Unavailable("directory offline".to_string()))
    }
}

/// Development CA that counts how often it is asked to sign.
pub struct CountingCertificateAuthority {
    inner: StaticCertificateAuthority,
    calls: AtomicUsize,
}

impl CountingCertificateAuthority {
    pub fn new() -> Self {
        Self {
            inner: StaticCertificateAuthority::new(chrono::Duration::hours(CA_VALIDITY_HOURS)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for CountingCertificateAuthority {
    async fn sign(&self, csr: &str, entity_id: &str) -> Result<SignedCertificate, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.sign(csr, entity_id).await
    }
}

/// Handles onto every in-memory component behind an `AppState`.
pub struct TestContext {
    pub config: VaultConfig,
    pub approle: AppRoleService,
    pub audit: Arc<InMemoryAuditSink>,
    pub agents: Arc<InMemoryAgentDirectory>,
    pub secrets: Arc<InMemorySecretAccess>,
    pub leases: Arc<InMemoryLeaseStore>,
    pub collaborators: Collaborators,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: VaultConfig) -> Self {
        let audit = Arc::new(InMemoryAuditSink::new());
        let approle = AppRoleService::new(
            Arc::new(InMemoryRoleStore::new()),
            TokenService::new(&config.token),
            AuditService::new(audit.clone()),
        );

        let agents = Arc::new(InMemoryAgentDirectory::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let secrets = Arc::new(InMemorySecretAccess::new(leases.clone()));
        let collaborators = Collaborators {
            agents: agents.clone(),
            secrets: secrets.clone(),
            leases: leases.clone(),
            ca: Arc::new(StaticCertificateAuthority::new(chrono::Duration::hours(
                CA_VALIDITY_HOURS,
            ))),
        };

        Self {
            config,
            approle,
            audit,
            agents,
            secrets,
            leases,
            collaborators,
        }
    }

    pub fn with_agent_directory(mut self, agents: Arc<dyn AgentDirectory>) -> Self {
        self.collaborators.agents = agents;
        self
    }

    pub fn with_certificate_authority(mut self, ca: Arc<dyn CertificateAuthority>) -> Self {
        self.collaborators.ca = ca;
        self
    }

    pub fn state(&self) -> AppState {
        let rate_limit = |limit, window| IpRateLimit {
            limiter: create_ip_rate_limiter(limit, window),
            trust_forwarded_for: self.config.security.trust_forwarded_for,
        };

        AppState {
            config: self.config.clone(),
            approle: self.approle.clone(),
            collaborators: self.collaborators.clone(),
            admin_rate_limit: rate_limit(
                self.config.rate_limit.admin_limit,
                self.config.rate_limit.admin_window_seconds,
            ),
            socket_rate_limit: rate_limit(
                self.config.rate_limit.socket_limit,
                self.config.rate_limit.socket_window_seconds,
            ),
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state())
    }
}

/// Attach the peer address that `into_make_service_with_connect_info` supplies in production.
pub fn with_peer(mut request: Request<Body>) -> Request<Body> {
    request.extensions_mut().insert(ConnectInfo(client_addr()));
    request
}
