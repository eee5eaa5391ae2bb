//! Registration key repository
//!
//! Keys are stored as argon2 hashes; the caller verifies the presented
//! secret against the hash before consuming. Consumption is an atomic
//! compare-and-increment so concurrent registrations never overshoot
//! `max_uses`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::error::map_sqlx;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct RegistrationKeyRow {
    pub id: Uuid,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub use_count: i32,
    pub max_uses: Option<i32>,
    pub revoked: bool,
}

#[derive(Clone)]
pub struct RegistrationKeyRepo {
    pool: PgPool,
}

impl RegistrationKeyRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a key row under the id embedded in the key string
    pub async fn issue(
        &self,
        id: Uuid,
        token_hash: &str,
        created_by: &str,
        expires_at: DateTime<Utc>,
        max_uses: Option<i32>,
    ) -> Result<RegistrationKeyRow> {
        sqlx::query_as::<_, RegistrationKeyRow>(
            r#"
            INSERT INTO registration_keys (id, token_hash, created_by, expires_at, max_uses)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, token_hash, created_by, created_at, expires_at, use_count, max_uses, revoked
            "#,
        )
        .bind(id)
        .bind(token_hash)
        .bind(created_by)
        .bind(expires_at)
        .bind(max_uses)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("registration key", e))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<RegistrationKeyRow>> {
        sqlx::query_as::<_, RegistrationKeyRow>(
            "SELECT id, token_hash, created_by, created_at, expires_at, use_count, max_uses, revoked
             FROM registration_keys WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("registration key", e))
    }

    /// Atomically consume one use of an unexpired, unrevoked key
    ///
    /// The guard and the increment run in a single statement so concurrent
    /// registrations cannot exceed `max_uses`.
    pub async fn consume(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE registration_keys
            SET use_count = use_count + 1
            WHERE id = $1 AND NOT revoked AND expires_at > now()
              AND (max_uses IS NULL OR use_count < max_uses)
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("consume registration key", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::Unauthorized(
                "registration key is expired, revoked, or exhausted".into(),
            ));
        }
        Ok(())
    }

    pub async fn revoke(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("UPDATE registration_keys SET revoked = TRUE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("revoke registration key", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("registration key".into()));
        }
        Ok(())
    }
}
