use service_core::error::AppError;
use thiserror::Error;

use super::role_store::StoreError;
use super::token::TokenError;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Token error: {0}")]
    Token(#[from] TokenError),

    /// The single failure reported for every login rejection.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Role not found")]
    RoleNotFound,
}

impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Store(StoreError::Database(e)) => AppError::DatabaseError(e.into()),
            ServiceError::Token(e) => AppError::InternalError(anyhow::anyhow!(e)),
            ServiceError::InvalidCredentials => {
                AppError::AuthError(anyhow::anyhow!("Invalid credentials"))
            }
            ServiceError::RoleNotFound => AppError::NotFound(anyhow::anyhow!("Role not found")),
        }
    }
}
