use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

/// Minimum accepted length of the token signing key in production.
const MIN_SIGNING_KEY_BYTES: usize = 32;
/// One year, in seconds.
const MAX_TOKEN_TTL_SECONDS: i64 = 31_536_000;

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: Option<DatabaseConfig>,
    pub token: TokenConfig,
    pub session: SessionConfig,
    pub security: SecurityConfig,
    pub collaborators: CollaboratorConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub signing_key: Secret<String>,
    pub ttl_seconds: i64,
    pub issuer: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub heartbeat_timeout_seconds: u64,
    pub unauthenticated_idle_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: Secret<String>,
    pub trust_forwarded_for: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollaboratorConfig {
    pub agent_directory_url: Option<String>,
    pub secret_access_url: Option<String>,
    pub lease_store_url: Option<String>,
    pub certificate_authority_url: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub admin_limit: u32,
    pub admin_window_seconds: u64,
    pub socket_limit: u32,
    pub socket_window_seconds: u64,
}

impl SessionConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn unauthenticated_idle(&self) -> Duration {
        Duration::from_secs(self.unauthenticated_idle_seconds)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            unauthenticated_idle_seconds: 300,
        }
    }
}

impl CollaboratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl VaultConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let database = match env::var("DATABASE_URL") {
            Ok(url) => Some(DatabaseConfig {
                url,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1")?,
            }),
            Err(_) if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required in production but not set"
                )))
            }
            Err(_) => None,
        };

        let config = VaultConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("vault-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database,
            token: TokenConfig {
                signing_key: Secret::new(get_env("TOKEN_SIGNING_KEY", None, true)?),
                ttl_seconds: parse_env("TOKEN_TTL_SECONDS", "3600")?,
                issuer: get_env("TOKEN_ISSUER", Some("vault-service"), is_prod)?,
            },
            session: SessionConfig {
                heartbeat_timeout_seconds: parse_env("HEARTBEAT_TIMEOUT_SECONDS", "90")?,
                unauthenticated_idle_seconds: parse_env("UNAUTHENTICATED_IDLE_SECONDS", "300")?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                admin_api_key: Secret::new(get_env("ADMIN_API_KEY", None, true)?),
                trust_forwarded_for: parse_env("TRUST_FORWARDED_FOR", "false")?,
            },
            collaborators: CollaboratorConfig {
                agent_directory_url: optional_url("AGENT_DIRECTORY_URL"),
                secret_access_url: optional_url("SECRET_ACCESS_URL"),
                lease_store_url: optional_url("LEASE_STORE_URL"),
                certificate_authority_url: optional_url("CERTIFICATE_AUTHORITY_URL"),
                timeout_seconds: parse_env("COLLABORATOR_TIMEOUT_SECONDS", "10")?,
            },
            rate_limit: RateLimitConfig {
                admin_limit: parse_env("RATE_LIMIT_ADMIN_LIMIT", "60")?,
                admin_window_seconds: parse_env("RATE_LIMIT_ADMIN_WINDOW_SECONDS", "60")?,
                socket_limit: parse_env("RATE_LIMIT_SOCKET_LIMIT", "30")?,
                socket_window_seconds: parse_env("RATE_LIMIT_SOCKET_WINDOW_SECONDS", "60")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.token.ttl_seconds <= 0 || self.token.ttl_seconds > MAX_TOKEN_TTL_SECONDS {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_TTL_SECONDS must be between 1 and {}",
                MAX_TOKEN_TTL_SECONDS
            )));
        }

        if self.token.signing_key.expose_secret().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_SIGNING_KEY must not be empty"
            )));
        }

        if self.security.admin_api_key.expose_secret().is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ADMIN_API_KEY must not be empty"
            )));
        }

        if self.session.heartbeat_timeout_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "HEARTBEAT_TIMEOUT_SECONDS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.token.signing_key.expose_secret().len() < MIN_SIGNING_KEY_BYTES {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "TOKEN_SIGNING_KEY must be at least {} bytes in production",
                    MIN_SIGNING_KEY_BYTES
                )));
            }

            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            let collaborators = &self.collaborators;
            if collaborators.agent_directory_url.is_none()
                || collaborators.secret_access_url.is_none()
                || collaborators.lease_store_url.is_none()
                || collaborators.certificate_authority_url.is_none()
            {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "All collaborator URLs must be configured in production"
                )));
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim().parse().map_err(|e: T::Err| {
        AppError::ConfigError(anyhow::anyhow!("{} has an invalid value: {}", key, e))
    })
}

fn optional_url(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim_end_matches('/').to_string())
        .filter(|s| !s.is_empty())
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
