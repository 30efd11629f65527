//! AppRole model - a credential-issuance unit for non-human agents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Default lifetime of a secret_id, in seconds.
pub const DEFAULT_SECRET_ID_TTL: i64 = 600;

/// Default number of logins a secret_id permits.
pub const DEFAULT_SECRET_ID_NUM_USES: i64 = 1;

/// Upper bound on a secret_id lifetime (ten years), in seconds.
pub const MAX_SECRET_ID_TTL: i64 = 315_360_000;

/// Persisted AppRole.
///
/// The plaintext `secret_id` is never stored; only its SHA-256 digest is.
#[derive(Debug, Clone, FromRow)]
pub struct Role {
    pub role_id: Uuid,
    pub role_name: String,
    pub secret_id_hash: String,
    pub secret_id_created_at: DateTime<Utc>,
    /// Seconds; 0 disables expiry.
    pub secret_id_ttl: i64,
    /// 0 means unlimited.
    pub secret_id_num_uses: i64,
    pub secret_id_uses: i64,
    pub bind_secret_id: bool,
    pub bound_cidr_list: Vec<String>,
    pub policies: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied settings for a new role. Unset fields take the defaults.
#[derive(Debug, Clone, Default)]
pub struct RoleOptions {
    pub secret_id_ttl: Option<i64>,
    pub secret_id_num_uses: Option<i64>,
    pub bind_secret_id: Option<bool>,
    pub bound_cidr_list: Vec<String>,
    pub policies: Vec<String>,
}

impl Role {
    pub fn new(role_name: String, secret_id: &str, options: RoleOptions) -> Self {
        let now = Utc::now();
        Self {
            role_id: Uuid::new_v4(),
            role_name,
            secret_id_hash: Self::hash_secret_id(secret_id),
            secret_id_created_at: now,
            secret_id_ttl: options
                .secret_id_ttl
                .unwrap_or(DEFAULT_SECRET_ID_TTL)
                .clamp(0, MAX_SECRET_ID_TTL),
            secret_id_num_uses: options
                .secret_id_num_uses
                .unwrap_or(DEFAULT_SECRET_ID_NUM_USES)
                .max(0),
            secret_id_uses: 0,
            bind_secret_id: options.bind_secret_id.unwrap_or(true),
            bound_cidr_list: options.bound_cidr_list,
            policies: options.policies,
            created_at: now,
            updated_at: now,
        }
    }

    /// SHA-256 hex digest used for storage and comparison.
    pub fn hash_secret_id(secret_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret_id.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// When the current secret_id stops being accepted, if ever.
    ///
    /// A TTL beyond the representable range never expires.
    pub fn secret_id_expires_at(&self) -> Option<DateTime<Utc>> {
        if self.secret_id_ttl <= 0 {
            return None;
        }
        Duration::try_seconds(self.secret_id_ttl)
            .and_then(|ttl| self.secret_id_created_at.checked_add_signed(ttl))
    }

    pub fn is_secret_id_expired(&self, now: DateTime<Utc>) -> bool {
        self.secret_id_expires_at()
            .is_some_and(|expires_at| now >= expires_at)
    }

    pub fn is_secret_id_exhausted(&self) -> bool {
        self.secret_id_num_uses != 0 && self.secret_id_uses >= self.secret_id_num_uses
    }

    /// Remaining logins, or `None` when unlimited.
    pub fn remaining_uses(&self) -> Option<i64> {
        (self.secret_id_num_uses != 0)
            .then(|| (self.secret_id_num_uses - self.secret_id_uses).max(0))
    }
}

/// Read-only projection of a role. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RoleMetadata {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub role_id: Uuid,
    #[schema(example = "payments-agent")]
    pub role_name: String,
    #[schema(value_type = String, format = "date-time")]
    pub secret_id_created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>, format = "date-time")]
    pub secret_id_expires_at: Option<DateTime<Utc>>,
    #[schema(example = 600)]
    pub secret_id_ttl: i64,
    #[schema(example = 1)]
    pub secret_id_num_uses: i64,
    #[schema(example = 0)]
    pub secret_id_uses: i64,
    pub bind_secret_id: bool,
    #[schema(example = json!(["10.0.0.0/8"]))]
    pub bound_cidr_list: Vec<String>,
    #[schema(example = json!(["default", "payments-read"]))]
    pub policies: Vec<String>,
    #[schema(value_type = String, format = "date-time")]
    pub created_at: DateTime<Utc>,
    #[schema(value_type = String, format = "date-time")]
    pub updated_at: DateTime<Utc>,
}

impl From<&Role> for RoleMetadata {
    fn from(role: &Role) -> Self {
        Self {
            role_id: role.role_id,
            role_name: role.role_name.clone(),
            secret_id_created_at: role.secret_id_created_at,
            secret_id_expires_at: role.secret_id_expires_at(),
            secret_id_ttl: role.secret_id_ttl,
            secret_id_num_uses: role.secret_id_num_uses,
            secret_id_uses: role.secret_id_uses,
            bind_secret_id: role.bind_secret_id,
            bound_cidr_list: role.bound_cidr_list.clone(),
            policies: role.policies.clone(),
            created_at: role.created_at,
            updated_at: role.updated_at,
        }
    }
}
