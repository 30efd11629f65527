//! Role persistence.
//!
//! Every mutation of a role's consumption state goes through a conditional
//! write so that concurrent logins against the same `role_id` serialize.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::PgPool;
use thiserror::Error;
use uuid::Uuid;

use crate::models::Role;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn insert(&self, role: &Role) -> Result<(), StoreError>;

    async fn find(&self, role_id: Uuid) -> Result<Option<Role>, StoreError>;

    /// All roles ordered by `created_at`, then `role_id`.
    async fn list(&self) -> Result<Vec<Role>, StoreError>;

    /// Returns `false` when no such role existed.
    async fn delete(&self, role_id: Uuid) -> Result<bool, StoreError>;

    /// Increment `secret_id_uses` only if the role still has the use count and
    /// secret digest the caller observed. Returns whether the write applied.
    async fn consume_secret_id(
        &self,
        role_id: Uuid,
        observed_uses: i64,
        observed_hash: &str,
    ) -> Result<bool, StoreError>;

    /// Replace the secret digest, reset uses to zero and restart the TTL clock
    /// in one write. Returns `false` when no such role existed.
    async fn replace_secret_id(
        &self,
        role_id: Uuid,
        secret_id_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

// ==================== PostgreSQL ====================

#[derive(Clone)]
pub struct PgRoleStore {
    pool: PgPool,
}

impl PgRoleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RoleStore for PgRoleStore {
    async fn insert(&self, role: &Role) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO approles (
                role_id, role_name, secret_id_hash, secret_id_created_at,
                secret_id_ttl, secret_id_num_uses, secret_id_uses, bind_secret_id,
                bound_cidr_list, policies, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(role.role_id)
        .bind(&role.role_name)
        .bind(&role.secret_id_hash)
        .bind(role.secret_id_created_at)
        .bind(role.secret_id_ttl)
        .bind(role.secret_id_num_uses)
        .bind(role.secret_id_uses)
        .bind(role.bind_secret_id)
        .bind(&role.bound_cidr_list)
        .bind(&role.policies)
        .bind(role.created_at)
        .bind(role.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, role_id: Uuid) -> Result<Option<Role>, StoreError> {
        let role = sqlx::query_as::<_, Role>("SELECT * FROM approles WHERE role_id = $1")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(role)
    }

    async fn list(&self) -> Result<Vec<Role>, StoreError> {
        let roles =
            sqlx::query_as::<_, Role>("SELECT * FROM approles ORDER BY created_at, role_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(roles)
    }

    async fn delete(&self, role_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM approles WHERE role_id = $1")
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume_secret_id(
        &self,
        role_id: Uuid,
        observed_uses: i64,
        observed_hash: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE approles
            SET secret_id_uses = secret_id_uses + 1, updated_at = NOW()
            WHERE role_id = $1 AND secret_id_uses = $2 AND secret_id_hash = $3
            "#,
        )
        .bind(role_id)
        .bind(observed_uses)
        .bind(observed_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_secret_id(
        &self,
        role_id: Uuid,
        secret_id_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE approles
            SET secret_id_hash = $2, secret_id_created_at = $3, secret_id_uses = 0, updated_at = $3
            WHERE role_id = $1
            "#,
        )
        .bind(role_id)
        .bind(secret_id_hash)
        .bind(created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        crate::db::ping(&self.pool).await?;
        Ok(())
    }
}

// ==================== In-memory ====================

/// DashMap-backed store. Per-key shard locks give the same per-role
/// serialization as the conditional SQL update.
#[derive(Default)]
pub struct InMemoryRoleStore {
    roles: DashMap<Uuid, Role>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn insert(&self, role: &Role) -> Result<(), StoreError> {
        self.roles.insert(role.role_id, role.clone());
        Ok(())
    }

    async fn find(&self, role_id: Uuid) -> Result<Option<Role>, StoreError> {
        Ok(self.roles.get(&role_id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<Role>, StoreError> {
        let mut roles: Vec<Role> = self.roles.iter().map(|r| r.value().clone()).collect();
        roles.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.role_id.cmp(&b.role_id))
        });
        Ok(roles)
    }

    async fn delete(&self, role_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.roles.remove(&role_id).is_some())
    }

    async fn consume_secret_id(
        &self,
        role_id: Uuid,
        observed_uses: i64,
        observed_hash: &str,
    ) -> Result<bool, StoreError> {
        let Some(mut role) = self.roles.get_mut(&role_id) else {
            return Ok(false);
        };
        if role.secret_id_uses != observed_uses || role.secret_id_hash != observed_hash {
            return Ok(false);
        }
        role.secret_id_uses += 1;
        role.updated_at = Utc::now();
        Ok(true)
    }

    async fn replace_secret_id(
        &self,
        role_id: Uuid,
        secret_id_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let Some(mut role) = self.roles.get_mut(&role_id) else {
            return Ok(false);
        };
        role.secret_id_hash = secret_id_hash.to_string();
        role.secret_id_created_at = created_at;
        role.secret_id_uses = 0;
        role.updated_at = created_at;
        Ok(true)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RoleOptions;

    fn role(name: &str) -> Role {
        Role::new(name.to_string(), "secret", RoleOptions::default())
    }

    #[tokio::test]
    async fn consume_requires_observed_state() {
        let store = InMemoryRoleStore::new();
        let role = role("svc");
        store.insert(&role).await.unwrap();

        assert!(!store
            .consume_secret_id(role.role_id, 1, &role.secret_id_hash)
            .await
            .unwrap());
        assert!(!store
            .consume_secret_id(role.role_id, 0, "other-digest")
            .await
            .unwrap());
        assert!(store
            .consume_secret_id(role.role_id, 0, &role.secret_id_hash)
            .await
            .unwrap());
        assert!(!store
            .consume_secret_id(role.role_id, 0, &role.secret_id_hash)
            .await
            .unwrap());

        let stored = store.find(role.role_id).await.unwrap().unwrap();
        assert_eq!(stored.secret_id_uses, 1);
    }

    #[tokio::test]
    async fn replace_resets_uses() {
        let store = InMemoryRoleStore::new();
        let role = role("svc");
        store.insert(&role).await.unwrap();
        store
            .consume_secret_id(role.role_id, 0, &role.secret_id_hash)
            .await
            .unwrap();

        let now = Utc::now();
        assert!(store
            .replace_secret_id(role.role_id, "new-digest", now)
            .await
            .unwrap());

        let stored = store.find(role.role_id).await.unwrap().unwrap();
        assert_eq!(stored.secret_id_uses, 0);
        assert_eq!(stored.secret_id_hash, "new-digest");
        assert_eq!(stored.secret_id_created_at, now);

        // A login that validated against the old digest cannot commit.
        assert!(!store
            .consume_secret_id(role.role_id, 0, &role.secret_id_hash)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn missing_role_operations_report_absence() {
        let store = InMemoryRoleStore::new();
        let id = Uuid::new_v4();

        assert!(store.find(id).await.unwrap().is_none());
        assert!(!store.delete(id).await.unwrap());
        assert!(!store.replace_secret_id(id, "x", Utc::now()).await.unwrap());
        assert!(!store.consume_secret_id(id, 0, "x").await.unwrap());
    }

    #[tokio::test]
    async fn list_is_ordered_by_creation() {
        let store = InMemoryRoleStore::new();
        let mut first = role("a");
        let mut second = role("b");
        first.created_at = Utc::now() - chrono::Duration::seconds(10);
        second.created_at = Utc::now();

        store.insert(&second).await.unwrap();
        store.insert(&first).await.unwrap();

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.role_name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn pg_conditional_increment() {
        let config = crate::config::DatabaseConfig {
            url: "postgres://localhost/vault_test".to_string(),
            max_connections: 5,
            min_connections: 1,
        };
        let pool = crate::db::connect(&config).await.unwrap();
        let store = PgRoleStore::new(pool);

        let role = role("pg");
        store.insert(&role).await.unwrap();
        assert!(store
            .consume_secret_id(role.role_id, 0, &role.secret_id_hash)
            .await
            .unwrap());
        assert!(!store
            .consume_secret_id(role.role_id, 0, &role.secret_id_hash)
            .await
            .unwrap());
        assert!(store.delete(role.role_id).await.unwrap());
    }
}
