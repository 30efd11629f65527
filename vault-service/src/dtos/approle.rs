use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::models::{RoleMetadata, RoleOptions};
use crate::services::cidr::parse_cidr;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 128, message = "Role name must be 1-128 characters"))]
    #[schema(example = "payments-agent")]
    pub role_name: String,

    /// Seconds until the secret_id expires. 0 disables expiry.
    #[validate(range(
        min = 0,
        max = 315_360_000,
        message = "secret_id_ttl must be between 0 and 315360000 seconds"
    ))]
    #[schema(example = 600)]
    pub secret_id_ttl: Option<i64>,

    /// Number of logins the secret_id allows. 0 means unlimited.
    #[validate(range(min = 0, message = "secret_id_num_uses cannot be negative"))]
    #[schema(example = 1)]
    pub secret_id_num_uses: Option<i64>,

    #[schema(example = true)]
    pub bind_secret_id: Option<bool>,

    #[validate(custom(function = "validate_cidr_list"))]
    #[schema(example = json!(["10.0.0.0/8", "192.168.1.10"]))]
    pub bound_cidr_list: Option<Vec<String>>,

    #[schema(example = json!(["default", "payments-read"]))]
    pub policies: Option<Vec<String>>,
}

impl CreateRoleRequest {
    pub fn into_parts(self) -> (String, RoleOptions) {
        let options = RoleOptions {
            secret_id_ttl: self.secret_id_ttl,
            secret_id_num_uses: self.secret_id_num_uses,
            bind_secret_id: self.bind_secret_id,
            bound_cidr_list: self.bound_cidr_list.unwrap_or_default(),
            policies: self.policies.unwrap_or_default(),
        };
        (self.role_name, options)
    }
}

fn validate_cidr_list(entries: &[String]) -> Result<(), ValidationError> {
    if entries.iter().all(|entry| parse_cidr(entry).is_some()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("cidr");
        err.message = Some("bound_cidr_list contains an invalid CIDR block".into());
        Err(err)
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateRoleResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub role_id: Uuid,
    /// Returned once. Only a digest is stored.
    #[schema(example = "q3Jx0Yh5dJb1m8N2pS6tV9wZ4cF7gK0lR3uX6yA9bE1")]
    pub secret_id: String,
    #[schema(example = "payments-agent")]
    pub role_name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RotateSecretResponse {
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub role_id: Uuid,
    #[schema(example = "Zb8mN3xQ1rT6vY9aC2eF5hJ8kL1oP4sU7wX0zB3dG6i")]
    pub secret_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RoleListResponse {
    pub roles: Vec<RoleMetadata>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginRequest {
    #[validate(length(min = 1, message = "role_id is required"))]
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub role_id: String,

    #[validate(length(min = 1, message = "secret_id is required"))]
    #[schema(example = "q3Jx0Yh5dJb1m8N2pS6tV9wZ4cF7gK0lR3uX6yA9bE1")]
    pub secret_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct LoginResponse {
    #[schema(example = "eyJhbGciOiJIUzI1NiIsInR5cCI6IkpXVCJ9...")]
    pub token: String,
    #[schema(example = json!(["default", "payments-read"]))]
    pub policies: Vec<String>,
    #[schema(example = "payments-agent")]
    pub role_name: String,
    #[schema(example = "550e8400-e29b-41d4-a716-446655440000")]
    pub role_id: Uuid,
    #[schema(value_type = String, format = "date-time")]
    pub expires_at: DateTime<Utc>,
}
