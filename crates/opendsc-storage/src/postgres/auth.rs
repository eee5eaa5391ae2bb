//! User, role, group, session, token, and ACL repository

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::error::map_sqlx;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct UserRow {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SessionRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PatRow {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

/// ACL levels in ascending order
pub const LEVEL_READ: i32 = 1;
pub const LEVEL_MODIFY: i32 = 2;
pub const LEVEL_MANAGE: i32 = 3;

#[derive(Clone)]
pub struct AuthRepo {
    pool: PgPool,
}

impl AuthRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create_user(
        &self,
        username: &str,
        display_name: &str,
        password_hash: &str,
    ) -> Result<UserRow> {
        sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (id, username, display_name, password_hash)
            VALUES ($1, $2, $3, $4)
            RETURNING id, username, display_name, password_hash, is_enabled, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(username)
        .bind(display_name)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(&format!("user {}", username), e))
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<UserRow>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, username, display_name, password_hash, is_enabled, created_at
             FROM users WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("user", e))
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, username, display_name, password_hash, is_enabled, created_at
             FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("user", e))
    }

    pub async fn count_users(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM users")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("users", e))
    }

    pub async fn create_role(&self, name: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO roles (id, name) VALUES ($1, $2)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx(&format!("role {}", name), e))?;
        Ok(id)
    }

    pub async fn grant_role_permission(&self, role_id: Uuid, permission: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO role_permissions (role_id, permission) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(role_id)
        .bind(permission)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("role permission", e))?;
        Ok(())
    }

    pub async fn assign_role(&self, user_id: Uuid, role_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("user role", e))?;
        Ok(())
    }

    /// The user's global permission set: role permissions granted directly
    /// and transitively through group membership
    pub async fn permissions_for_user(&self, user_id: Uuid) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT rp.permission
            FROM role_permissions rp
            WHERE rp.role_id IN (
                SELECT role_id FROM user_roles WHERE user_id = $1
                UNION
                SELECT gr.role_id FROM group_roles gr
                JOIN group_members gm ON gm.group_id = gr.group_id
                WHERE gm.user_id = $1
            )
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("permissions", e))
    }

    /// Groups the user belongs to
    pub async fn groups_for_user(&self, user_id: Uuid) -> Result<Vec<Uuid>> {
        sqlx::query_scalar::<_, Uuid>(
            "SELECT group_id FROM group_members WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("groups", e))
    }

    /// Highest ACL level any of the principals holds on the resource
    pub async fn acl_level(
        &self,
        principals: &[Uuid],
        resource_type: &str,
        resource_id: Uuid,
    ) -> Result<Option<i32>> {
        sqlx::query_scalar::<_, Option<i32>>(
            r#"
            SELECT max(level) FROM resource_permissions
            WHERE principal_id = ANY($1) AND resource_type = $2 AND resource_id = $3
            "#,
        )
        .bind(principals)
        .bind(resource_type)
        .bind(resource_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("acl", e))
    }

    pub async fn grant_resource_permission(
        &self,
        principal_id: Uuid,
        principal_type: &str,
        resource_type: &str,
        resource_id: Uuid,
        level: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resource_permissions (id, principal_id, principal_type, resource_type, resource_id, level)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (principal_id, principal_type, resource_type, resource_id)
            DO UPDATE SET level = EXCLUDED.level
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(principal_id)
        .bind(principal_type)
        .bind(resource_type)
        .bind(resource_id)
        .bind(level)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("resource permission", e))?;
        Ok(())
    }

    // Sessions

    pub async fn create_session(&self, user_id: Uuid) -> Result<SessionRow> {
        sqlx::query_as::<_, SessionRow>(
            r#"
            INSERT INTO sessions (id, user_id)
            VALUES ($1, $2)
            RETURNING id, user_id, created_at, last_seen_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("session", e))
    }

    pub async fn get_session(&self, id: Uuid) -> Result<Option<SessionRow>> {
        sqlx::query_as::<_, SessionRow>(
            "SELECT id, user_id, created_at, last_seen_at FROM sessions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("session", e))
    }

    /// Slide the idle window forward
    pub async fn touch_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_seen_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("session", e))?;
        Ok(())
    }

    pub async fn delete_session(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("session", e))?;
        Ok(())
    }

    // Personal access tokens

    /// Insert a token row under the id embedded in the token string
    pub async fn create_pat(
        &self,
        id: Uuid,
        user_id: Uuid,
        token_hash: &str,
        label: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<PatRow> {
        sqlx::query_as::<_, PatRow>(
            r#"
            INSERT INTO personal_access_tokens (id, user_id, token_hash, label, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, token_hash, label, created_at, expires_at, revoked
            "#,
        )
        .bind(id)
        .bind(user_id)
        .bind(token_hash)
        .bind(label)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("personal access token", e))
    }

    pub async fn get_pat(&self, id: Uuid) -> Result<Option<PatRow>> {
        sqlx::query_as::<_, PatRow>(
            "SELECT id, user_id, token_hash, label, created_at, expires_at, revoked
             FROM personal_access_tokens WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("personal access token", e))
    }

    pub async fn revoke_pat(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE personal_access_tokens SET revoked = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("personal access token", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("personal access token".into()));
        }
        Ok(())
    }
}
