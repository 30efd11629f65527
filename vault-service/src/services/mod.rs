pub mod approle;
pub mod audit;
pub mod cidr;
pub mod collaborators;
pub mod error;
pub mod role_store;
pub mod token;

pub use approle::{AppRoleService, CreatedRole, LoginFailureReason, LoginResult};
pub use audit::{AuditService, AuditSink, InMemoryAuditSink, PgAuditSink};
pub use collaborators::{
    AgentDirectory, CertificateAuthority, CollaboratorError, Collaborators, LeaseStore,
    SecretAccess,
};
pub use error::ServiceError;
pub use role_store::{InMemoryRoleStore, PgRoleStore, RoleStore, StoreError};
pub use token::{TokenClaims, TokenError, TokenService};
