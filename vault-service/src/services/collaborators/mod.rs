//! Services the session layer delegates to but does not own.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

pub use http::{HttpAgentDirectory, HttpCertificateAuthority, HttpLeaseStore, HttpSecretAccess};
pub use memory::{
    AgentRecord, InMemoryAgentDirectory, InMemoryLeaseStore, InMemorySecretAccess, LeaseRecord,
    StaticCertificateAuthority,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollaboratorError {
    #[error("Not found")]
    NotFound,

    #[error("Access denied")]
    Denied,

    #[error("Not owned by caller")]
    NotOwned,

    #[error("Not renewable")]
    NotRenewable,

    #[error("Expired")]
    Expired,

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Unavailable(err.to_string())
    }
}

/// Identity handed to the agent directory after a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub role_id: Uuid,
    pub role_name: String,
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretPayload {
    pub path: String,
    pub data: serde_json::Value,
    pub lease_id: String,
    pub lease_duration: i64,
    pub renewable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRenewal {
    pub lease_id: String,
    pub lease_duration: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedCertificate {
    pub certificate: String,
    pub ca_chain: Vec<String>,
    pub valid_until: DateTime<Utc>,
}

#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Register an authenticated agent and return its id.
    async fn bootstrap(&self, registration: &AgentRegistration)
        -> Result<String, CollaboratorError>;

    async fn mark_disconnected(&self, agent_id: &str) -> Result<(), CollaboratorError>;

    async fn touch_heartbeat(&self, agent_id: &str) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait SecretAccess: Send + Sync {
    async fn read(&self, agent_id: &str, path: &str) -> Result<SecretPayload, CollaboratorError>;
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Extend a lease held by `agent_id`.
    async fn renew(&self, lease_id: &str, agent_id: &str)
        -> Result<LeaseRenewal, CollaboratorError>;
}

#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn sign(&self, csr: &str, entity_id: &str)
        -> Result<SignedCertificate, CollaboratorError>;
}

/// The four collaborators a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub agents: Arc<dyn AgentDirectory>,
    pub secrets: Arc<dyn SecretAccess>,
    pub leases: Arc<dyn LeaseStore>,
    pub ca: Arc<dyn CertificateAuthority>,
}
