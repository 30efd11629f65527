use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

use service_core::error::AppError;
use service_core::middleware::rate_limit::{create_ip_rate_limiter, IpRateLimit};
use service_core::observability::init_tracing;
use vault_service::{
    build_router,
    config::VaultConfig,
    db,
    services::{
        collaborators::{
            CollaboratorError, HttpAgentDirectory, HttpCertificateAuthority, HttpLeaseStore,
            HttpSecretAccess, InMemoryAgentDirectory, InMemoryLeaseStore, InMemorySecretAccess,
            StaticCertificateAuthority,
        },
        AgentDirectory, AppRoleService, AuditService, AuditSink, CertificateAuthority,
        Collaborators, InMemoryAuditSink, InMemoryRoleStore, LeaseStore, PgAuditSink,
        PgRoleStore, RoleStore, SecretAccess, TokenService,
    },
    AppState,
};

/// Validity of certificates from the development CA.
const DEV_CERTIFICATE_VALIDITY_HOURS: i64 = 24;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Load configuration - fail fast if invalid
    let config = VaultConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    )
    .map_err(AppError::ConfigError)?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting vault service"
    );

    let (store, sink): (Arc<dyn RoleStore>, Arc<dyn AuditSink>) = match &config.database {
        Some(database) => {
            let pool = db::connect(database)
                .await
                .map_err(AppError::DatabaseError)?;
            (
                Arc::new(PgRoleStore::new(pool.clone())),
                Arc::new(PgAuditSink::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, roles and audit events are kept in memory");
            (
                Arc::new(InMemoryRoleStore::new()),
                Arc::new(InMemoryAuditSink::new()),
            )
        }
    };

    let tokens = TokenService::new(&config.token);
    let approle = AppRoleService::new(store, tokens, AuditService::new(sink));
    let collaborators = build_collaborators(&config)?;

    let admin_rate_limit = IpRateLimit {
        limiter: create_ip_rate_limiter(
            config.rate_limit.admin_limit,
            config.rate_limit.admin_window_seconds,
        ),
        trust_forwarded_for: config.security.trust_forwarded_for,
    };
    let socket_rate_limit = IpRateLimit {
        limiter: create_ip_rate_limiter(
            config.rate_limit.socket_limit,
            config.rate_limit.socket_window_seconds,
        ),
        trust_forwarded_for: config.security.trust_forwarded_for,
    };
    tracing::info!("Rate limiters initialized: admin/login and socket upgrade");

    let state = AppState {
        config: config.clone(),
        approle,
        collaborators,
        admin_rate_limit,
        socket_rate_limit,
    };
    let app = build_router(state);

    let addr = config.common.bind_address();

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
    );
    let _guard = service_span.enter();

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

/// HTTP clients for configured collaborators, in-process doubles for the rest.
fn build_collaborators(config: &VaultConfig) -> Result<Collaborators, AppError> {
    let settings = &config.collaborators;
    let client = reqwest::Client::new();
    let timeout = settings.timeout();
    let invalid = |name: &str, e: CollaboratorError| {
        AppError::ConfigError(anyhow::anyhow!("{} is not a usable base URL: {}", name, e))
    };

    let agents: Arc<dyn AgentDirectory> = match &settings.agent_directory_url {
        Some(url) => Arc::new(
            HttpAgentDirectory::new(client.clone(), url, timeout)
                .map_err(|e| invalid("AGENT_DIRECTORY_URL", e))?,
        ),
        None => {
            tracing::warn!("AGENT_DIRECTORY_URL not set, using in-memory agent directory");
            Arc::new(InMemoryAgentDirectory::new())
        }
    };

    let memory_leases = Arc::new(InMemoryLeaseStore::new());

    let secrets: Arc<dyn SecretAccess> = match &settings.secret_access_url {
        Some(url) => Arc::new(
            HttpSecretAccess::new(client.clone(), url, timeout)
                .map_err(|e| invalid("SECRET_ACCESS_URL", e))?,
        ),
        None => {
            tracing::warn!("SECRET_ACCESS_URL not set, using in-memory secret store");
            Arc::new(InMemorySecretAccess::new(memory_leases.clone()))
        }
    };

    let leases: Arc<dyn LeaseStore> = match &settings.lease_store_url {
        Some(url) => Arc::new(
            HttpLeaseStore::new(client.clone(), url, timeout)
                .map_err(|e| invalid("LEASE_STORE_URL", e))?,
        ),
        None => {
            tracing::warn!("LEASE_STORE_URL not set, using in-memory lease store");
            memory_leases
        }
    };

    let ca: Arc<dyn CertificateAuthority> = match &settings.certificate_authority_url {
        Some(url) => Arc::new(
            HttpCertificateAuthority::new(client, url, timeout)
                .map_err(|e| invalid("CERTIFICATE_AUTHORITY_URL", e))?,
        ),
        None => {
            tracing::warn!("CERTIFICATE_AUTHORITY_URL not set, using static development CA");
            Arc::new(StaticCertificateAuthority::new(chrono::Duration::hours(
                DEV_CERTIFICATE_VALIDITY_HOURS,
            )))
        }
    };

    Ok(Collaborators {
        agents,
        secrets,
        leases,
        ca,
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections");
}
