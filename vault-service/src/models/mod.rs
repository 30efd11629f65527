pub mod audit_event;
pub mod role;

pub use audit_event::{ActorType, AuditContext, AuditEvent, AuditEventType};
pub use role::{Role, RoleMetadata, RoleOptions};
