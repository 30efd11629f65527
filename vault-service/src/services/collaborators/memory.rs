//! In-process collaborators for development without external services.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use super::{
    AgentDirectory, AgentRegistration, CertificateAuthority, CollaboratorError, LeaseRenewal,
    LeaseStore, SecretAccess, SecretPayload, SignedCertificate,
};

// ==================== Agent directory ====================

/// A connected agent. Records are dropped on disconnect.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub agent_id: String,
    pub role_id: Uuid,
    pub role_name: String,
    pub policies: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryAgentDirectory {
    agents: DashMap<String, AgentRecord>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.get(agent_id).map(|a| a.value().clone())
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn bootstrap(
        &self,
        registration: &AgentRegistration,
    ) -> Result<String, CollaboratorError> {
        let agent_id = Uuid::new_v4().to_string();
        self.agents.insert(
            agent_id.clone(),
            AgentRecord {
                agent_id: agent_id.clone(),
                role_id: registration.role_id,
                role_name: registration.role_name.clone(),
                policies: registration.policies.clone(),
                last_heartbeat: Utc::now(),
            },
        );
        Ok(agent_id)
    }

    async fn mark_disconnected(&self, agent_id: &str) -> Result<(), CollaboratorError> {
        self.agents
            .remove(agent_id)
            .map(|_| ())
            .ok_or(CollaboratorError::NotFound)
    }

    async fn touch_heartbeat(&self, agent_id: &str) -> Result<(), CollaboratorError> {
        let mut agent = self
            .agents
            .get_mut(agent_id)
            .ok_or(CollaboratorError::NotFound)?;
        agent.last_heartbeat = Utc::now();
        Ok(())
    }
}

// ==================== Lease store ====================

/// A lease handed out with a secret.
#[derive(Debug, Clone)]
pub struct LeaseRecord {
    pub lease_id: String,
    pub owner: String,
    /// Extension applied per renewal.
    pub increment: Duration,
    /// Hard cap measured from `issued_at`.
    pub max_ttl: Duration,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewable: bool,
}

impl LeaseRecord {
    pub fn new(owner: &str, increment: Duration, max_ttl: Duration, renewable: bool) -> Self {
        let issued_at = Utc::now();
        Self {
            lease_id: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            increment,
            max_ttl,
            issued_at,
            expires_at: issued_at + increment.min(max_ttl),
            renewable,
        }
    }
}

#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: DashMap<String, LeaseRecord>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a lease, dropping any that have already expired.
    pub fn insert(&self, lease: LeaseRecord) {
        self.prune_expired(Utc::now());
        self.leases.insert(lease.lease_id.clone(), lease);
    }

    pub fn lease(&self, lease_id: &str) -> Option<LeaseRecord> {
        self.leases.get(lease_id).map(|l| l.value().clone())
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Remove every lease past its expiry at `now`. Returns how many went.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.leases.len();
        self.leases.retain(|_, lease| now < lease.expires_at);
        before.saturating_sub(self.leases.len())
    }

    /// Renew against an explicit clock.
    pub fn renew_at(
        &self,
        lease_id: &str,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<LeaseRenewal, CollaboratorError> {
        let mut lease = self
            .leases
            .get_mut(lease_id)
            .ok_or(CollaboratorError::NotFound)?;

        if lease.owner != agent_id {
            return Err(CollaboratorError::NotOwned);
        }
        let hard_limit = lease.issued_at + lease.max_ttl;
        if now >= lease.expires_at || now >= hard_limit {
            return Err(CollaboratorError::Expired);
        }
        if !lease.renewable {
            return Err(CollaboratorError::NotRenewable);
        }

        lease.expires_at = (now + lease.increment).min(hard_limit);
        Ok(LeaseRenewal {
            lease_id: lease.lease_id.clone(),
            lease_duration: (lease.expires_at - now).num_seconds(),
        })
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn renew(
        &self,
        lease_id: &str,
        agent_id: &str,
    ) -> Result<LeaseRenewal, CollaboratorError> {
        let now = Utc::now();
        let result = self.renew_at(lease_id, agent_id, now);
        if matches!(result, Err(CollaboratorError::Expired)) {
            self.leases.remove(lease_id);
        }
        result
    }
}

// ==================== Secret access ====================

#[derive(Debug, Clone)]
struct SecretEntry {
    data: serde_json::Value,
    lease_duration: Duration,
    max_ttl: Duration,
    renewable: bool,
}

/// Secrets keyed by path. Agents see a path only under a granted prefix;
/// a grant for `"*"` applies to every agent. Each read issues a lease.
pub struct InMemorySecretAccess {
    secrets: DashMap<String, SecretEntry>,
    grants: DashMap<String, Vec<String>>,
    leases: Arc<InMemoryLeaseStore>,
}

impl InMemorySecretAccess {
    pub fn new(leases: Arc<InMemoryLeaseStore>) -> Self {
        Self {
            secrets: DashMap::new(),
            grants: DashMap::new(),
            leases,
        }
    }

    pub fn put_secret(
        &self,
        path: &str,
        data: serde_json::Value,
        lease_duration: Duration,
        max_ttl: Duration,
        renewable: bool,
    ) {
        self.secrets.insert(
            path.to_string(),
            SecretEntry {
                data,
                lease_duration,
                max_ttl,
                renewable,
            },
        );
    }

    pub fn grant(&self, agent_id: &str, path_prefix: &str) {
        self.grants
            .entry(agent_id.to_string())
            .or_default()
            .push(path_prefix.to_string());
    }

    fn is_granted(&self, agent_id: &str, path: &str) -> bool {
        [agent_id, "*"].iter().any(|key| {
            self.grants
                .get(*key)
                .is_some_and(|prefixes| prefixes.iter().any(|p| path.starts_with(p.as_str())))
        })
    }
}

#[async_trait]
impl SecretAccess for InMemorySecretAccess {
    async fn read(&self, agent_id: &str, path: &str) -> Result<SecretPayload, CollaboratorError> {
        // Grants first, so existence is not revealed to unauthorized agents.
        if !self.is_granted(agent_id, path) {
            return Err(CollaboratorError::Denied);
        }
        let entry = self
            .secrets
            .get(path)
            .map(|e| e.value().clone())
            .ok_or(CollaboratorError::NotFound)?;

        let lease = LeaseRecord::new(agent_id, entry.lease_duration, entry.max_ttl, entry.renewable);
        let payload = SecretPayload {
            path: path.to_string(),
            data: entry.data,
            lease_id: lease.lease_id.clone(),
            lease_duration: (lease.expires_at - lease.issued_at).num_seconds(),
            renewable: lease.renewable,
        };
        self.leases.insert(lease);
        Ok(payload)
    }
}

// ==================== Certificate authority ====================

/// Stand-in CA for development. Returns a deterministic PEM body derived
/// from the request; it does not perform real signing.
pub struct StaticCertificateAuthority {
    validity: Duration,
    ca_certificate: String,
}

impl StaticCertificateAuthority {
    pub fn new(validity: Duration) -> Self {
        Self {
            validity,
            ca_certificate: pem("CERTIFICATE", b"vault-service development root"),
        }
    }
}

fn pem(label: &str, body: &[u8]) -> String {
    format!(
        "-----BEGIN {label}-----\n{}\n-----END {label}-----\n",
        STANDARD.encode(body)
    )
}

#[async_trait]
impl CertificateAuthority for StaticCertificateAuthority {
    async fn sign(
        &self,
        csr: &str,
        entity_id: &str,
    ) -> Result<SignedCertificate, CollaboratorError> {
        let digest = hex::encode(Sha256::digest(csr.as_bytes()));
        let body = format!("subject={};csr_sha256={}", entity_id, digest);

        Ok(SignedCertificate {
            certificate: pem("CERTIFICATE", body.as_bytes()),
            ca_chain: vec![self.ca_certificate.clone()],
            valid_until: Utc::now() + self.validity,
        })
    }
}
