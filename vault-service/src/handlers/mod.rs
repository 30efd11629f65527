//! HTTP handlers for vault-service.

pub mod approle;
pub mod health;

pub use approle::*;
pub use health::*;
