//! HTTP JSON clients for the external collaborators.
//!
//! Each request carries the W3C trace context of the calling span.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use service_core::observability::TracedClientExt;
use std::time::Duration;
use tracing::instrument;

use super::{
    AgentDirectory, AgentRegistration, CertificateAuthority, CollaboratorError, LeaseRenewal,
    LeaseStore, SecretAccess, SecretPayload, SignedCertificate,
};

/// Base URL plus a shared connection pool.
#[derive(Clone)]
struct CollaboratorClient {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl CollaboratorClient {
    fn new(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let base_url = Url::parse(base_url).map_err(|e| {
            CollaboratorError::Unavailable(format!("Invalid base URL {}: {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(CollaboratorError::Unavailable(format!(
                "Base URL {} cannot carry a path",
                base_url
            )));
        }
        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    /// Append `segments` to the base path. Each segment is percent-encoded,
    /// so caller-supplied values cannot add segments or a query.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, CollaboratorError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| CollaboratorError::Unavailable("Base URL cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, CollaboratorError> {
    response
        .json::<T>()
        .await
        .map_err(|e| CollaboratorError::Unavailable(format!("Malformed response: {}", e)))
}

fn unexpected(status: StatusCode) -> CollaboratorError {
    if status.is_client_error() {
        CollaboratorError::Rejected(format!("status {}", status))
    } else {
        CollaboratorError::Unavailable(format!("status {}", status))
    }
}

// ==================== Agent directory ====================

#[derive(Clone)]
pub struct HttpAgentDirectory {
    inner: CollaboratorClient,
}

impl HttpAgentDirectory {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let inner = CollaboratorClient::new(client, base_url, timeout)?;
        tracing::info!(url = %inner.base_url, "Agent directory client configured");
        Ok(Self { inner })
    }

    async fn post_agent_action(&self, agent_id: &str, action: &str) -> Result<(), CollaboratorError> {
        let url = self.inner.url(["agents", agent_id, action])?;
        let response = self
            .inner
            .client
            .traced_post(url.as_str())
            .timeout(self.inner.timeout)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(CollaboratorError::NotFound),
            s => Err(unexpected(s)),
        }
    }
}

#[derive(Deserialize)]
struct BootstrapResponse {
    agent_id: String,
}

#[async_trait]
impl AgentDirectory for HttpAgentDirectory {
    #[instrument(skip(self, registration), fields(role_id = %registration.role_id))]
    async fn bootstrap(
        &self,
        registration: &AgentRegistration,
    ) -> Result<String, CollaboratorError> {
        let response = self
            .inner
            .client
            .traced_post(self.inner.url(["agents", "bootstrap"])?.as_str())
            .json(registration)
            .timeout(self.inner.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(unexpected(response.status()));
        }
        let body: BootstrapResponse = decode(response).await?;
        Ok(body.agent_id)
    }

    async fn mark_disconnected(&self, agent_id: &str) -> Result<(), CollaboratorError> {
        self.post_agent_action(agent_id, "disconnect").await
    }

    async fn touch_heartbeat(&self, agent_id: &str) -> Result<(), CollaboratorError> {
        self.post_agent_action(agent_id, "heartbeat").await
    }
}

// ==================== Secret access ====================

#[derive(Clone)]
pub struct HttpSecretAccess {
    inner: CollaboratorClient,
}

impl HttpSecretAccess {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let inner = CollaboratorClient::new(client, base_url, timeout)?;
        tracing::info!(url = %inner.base_url, "Secret access client configured");
        Ok(Self { inner })
    }
}

#[async_trait]
impl SecretAccess for HttpSecretAccess {
    #[instrument(skip(self), fields(agent_id = %agent_id, path = %path))]
    async fn read(&self, agent_id: &str, path: &str) -> Result<SecretPayload, CollaboratorError> {
        let url = self
            .inner
            .url(std::iter::once("secrets").chain(path.split('/')))?;
        let response = self
            .inner
            .client
            .traced_get(url.as_str())
            .header("x-agent-id", agent_id)
            .timeout(self.inner.timeout)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => decode(response).await,
            StatusCode::NOT_FOUND => Err(CollaboratorError::NotFound),
            StatusCode::FORBIDDEN => Err(CollaboratorError::Denied),
            s => Err(unexpected(s)),
        }
    }
}

// ==================== Lease store ====================

#[derive(Clone)]
pub struct HttpLeaseStore {
    inner: CollaboratorClient,
}

impl HttpLeaseStore {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let inner = CollaboratorClient::new(client, base_url, timeout)?;
        tracing::info!(url = %inner.base_url, "Lease store client configured");
        Ok(Self { inner })
    }
}

#[derive(Deserialize)]
struct RenewResponse {
    lease_duration: i64,
}

#[async_trait]
impl LeaseStore for HttpLeaseStore {
    #[instrument(skip(self), fields(lease_id = %lease_id, agent_id = %agent_id))]
    async fn renew(
        &self,
        lease_id: &str,
        agent_id: &str,
    ) -> Result<LeaseRenewal, CollaboratorError> {
        let url = self.inner.url(["leases", lease_id, "renew"])?;
        let response = self
            .inner
            .client
            .traced_post(url.as_str())
            .json(&json!({ "agent_id": agent_id }))
            .timeout(self.inner.timeout)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => {
                let body: RenewResponse = decode(response).await?;
                Ok(LeaseRenewal {
                    lease_id: lease_id.to_string(),
                    lease_duration: body.lease_duration,
                })
            }
            StatusCode::NOT_FOUND => Err(CollaboratorError::NotFound),
            StatusCode::FORBIDDEN => Err(CollaboratorError::NotOwned),
            StatusCode::CONFLICT => Err(CollaboratorError::NotRenewable),
            StatusCode::GONE => Err(CollaboratorError::Expired),
            s => Err(unexpected(s)),
        }
    }
}

// ==================== Certificate authority ====================

#[derive(Clone)]
pub struct HttpCertificateAuthority {
    inner: CollaboratorClient,
}

impl HttpCertificateAuthority {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        let inner = CollaboratorClient::new(client, base_url, timeout)?;
        tracing::info!(url = %inner.base_url, "Certificate authority client configured");
        Ok(Self { inner })
    }
}

#[async_trait]
impl CertificateAuthority for HttpCertificateAuthority {
    #[instrument(skip(self, csr), fields(entity_id = %entity_id))]
    async fn sign(
        &self,
        csr: &str,
        entity_id: &str,
    ) -> Result<SignedCertificate, CollaboratorError> {
        let response = self
            .inner
            .client
            .traced_post(self.inner.url(["sign"])?.as_str())
            .json(&json!({ "csr": csr, "entity_id": entity_id }))
            .timeout(self.inner.timeout)
            .send()
            .await?;

        match response.status() {
            s if s.is_success() => decode(response).await,
            s => Err(unexpected(s)),
        }
    }
}
