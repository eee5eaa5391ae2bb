//! Scope type and scope value repository
//!
//! `Default` (precedence 0) and `Node` (always the highest precedence) are
//! system types seeded by migration and never deleted. Precedence changes go
//! through an atomic full-map reorder so no transient duplicate precedence
//! is ever observable.

use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::error::map_sqlx;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScopeTypeRow {
    pub id: Uuid,
    pub name: String,
    pub precedence: i32,
    pub allows_values: bool,
    pub is_system: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ScopeValueRow {
    pub id: Uuid,
    pub scope_type_id: Uuid,
    pub value: String,
}

#[derive(Clone)]
pub struct ScopeRepo {
    pool: PgPool,
}

impl ScopeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list_types(&self) -> Result<Vec<ScopeTypeRow>> {
        sqlx::query_as::<_, ScopeTypeRow>(
            "SELECT id, name, precedence, allows_values, is_system
             FROM scope_types ORDER BY precedence",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("scope types", e))
    }

    pub async fn get_type(&self, id: Uuid) -> Result<Option<ScopeTypeRow>> {
        sqlx::query_as::<_, ScopeTypeRow>(
            "SELECT id, name, precedence, allows_values, is_system
             FROM scope_types WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("scope type", e))
    }

    pub async fn get_type_by_name(&self, name: &str) -> Result<Option<ScopeTypeRow>> {
        sqlx::query_as::<_, ScopeTypeRow>(
            "SELECT id, name, precedence, allows_values, is_system
             FROM scope_types WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("scope type", e))
    }

    /// Insert a custom scope type; when the requested precedence collides
    /// with or exceeds Node's, Node is shifted up in the same transaction so
    /// it stays the highest
    pub async fn create_type(&self, name: &str, precedence: i32, allows_values: bool) -> Result<ScopeTypeRow> {
        if precedence <= 0 {
            return Err(Error::Validation(
                "custom scope precedence must be positive (0 is reserved for Default)".into(),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("begin", e))?;

        let node_precedence: i32 = sqlx::query_scalar(
            "SELECT precedence FROM scope_types WHERE name = 'Node' FOR UPDATE",
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx("node scope", e))?;

        if precedence >= node_precedence {
            sqlx::query("UPDATE scope_types SET precedence = $1 WHERE name = 'Node'")
                .bind(precedence + 1)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx("shift node scope", e))?;
        }

        let row = sqlx::query_as::<_, ScopeTypeRow>(
            r#"
            INSERT INTO scope_types (id, name, precedence, allows_values, is_system)
            VALUES ($1, $2, $3, $4, FALSE)
            RETURNING id, name, precedence, allows_values, is_system
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(precedence)
        .bind(allows_values)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx(&format!("scope type {}", name), e))?;

        tx.commit().await.map_err(|e| map_sqlx("commit", e))?;
        Ok(row)
    }

    /// Atomically rewrite the full precedence map
    ///
    /// The map must cover every scope type, keep `Default` at 0, and keep
    /// `Node` strictly highest. Rows are first parked at negative staging
    /// precedences so the unique constraint never sees a transient duplicate.
    pub async fn reorder(&self, desired: &[(Uuid, i32)]) -> Result<()> {
        let types = self.list_types().await?;

        if desired.len() != types.len() {
            return Err(Error::Validation(format!(
                "reorder must cover all {} scope types, got {}",
                types.len(),
                desired.len()
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for (_, precedence) in desired {
            if !seen.insert(*precedence) {
                return Err(Error::Validation(format!("duplicate precedence {}", precedence)));
            }
        }
        for scope_type in &types {
            let assigned = desired
                .iter()
                .find(|(id, _)| *id == scope_type.id)
                .map(|(_, p)| *p)
                .ok_or_else(|| {
                    Error::Validation(format!("scope type {} missing from reorder", scope_type.name))
                })?;
            if scope_type.name == "Default" && assigned != 0 {
                return Err(Error::Validation("Default must stay at precedence 0".into()));
            }
            if scope_type.name == "Node" {
                let max_other = desired
                    .iter()
                    .filter(|(id, _)| *id != scope_type.id)
                    .map(|(_, p)| *p)
                    .max()
                    .unwrap_or(0);
                if assigned <= max_other {
                    return Err(Error::Validation("Node must keep the highest precedence".into()));
                }
            }
        }

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("begin", e))?;

        for (index, (id, _)) in desired.iter().enumerate() {
            sqlx::query("UPDATE scope_types SET precedence = $1 WHERE id = $2")
                .bind(-(index as i32) - 1)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx("stage precedence", e))?;
        }
        for (id, precedence) in desired {
            sqlx::query("UPDATE scope_types SET precedence = $1 WHERE id = $2")
                .bind(precedence)
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx("apply precedence", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx("commit", e))?;
        Ok(())
    }

    /// Delete a custom scope type; system types refuse
    pub async fn delete_type(&self, id: Uuid) -> Result<()> {
        let scope_type = self
            .get_type(id)
            .await?
            .ok_or_else(|| Error::NotFound("scope type".into()))?;
        if scope_type.is_system {
            return Err(Error::Conflict(format!(
                "system scope type {} cannot be deleted",
                scope_type.name
            )));
        }

        sqlx::query("DELETE FROM scope_types WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("scope type", e))?;
        Ok(())
    }

    /// Add a value to a scope type that allows values
    pub async fn add_value(&self, scope_type_id: Uuid, value: &str) -> Result<ScopeValueRow> {
        let scope_type = self
            .get_type(scope_type_id)
            .await?
            .ok_or_else(|| Error::NotFound("scope type".into()))?;
        if !scope_type.allows_values {
            return Err(Error::Validation(format!(
                "scope type {} does not allow values",
                scope_type.name
            )));
        }

        sqlx::query_as::<_, ScopeValueRow>(
            r#"
            INSERT INTO scope_values (id, scope_type_id, value)
            VALUES ($1, $2, $3)
            RETURNING id, scope_type_id, value
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(scope_type_id)
        .bind(value)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(&format!("scope value {}", value), e))
    }

    pub async fn get_value(&self, id: Uuid) -> Result<Option<ScopeValueRow>> {
        sqlx::query_as::<_, ScopeValueRow>(
            "SELECT id, scope_type_id, value FROM scope_values WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("scope value", e))
    }

    pub async fn find_value(&self, scope_type_id: Uuid, value: &str) -> Result<Option<ScopeValueRow>> {
        sqlx::query_as::<_, ScopeValueRow>(
            "SELECT id, scope_type_id, value FROM scope_values
             WHERE scope_type_id = $1 AND value = $2",
        )
        .bind(scope_type_id)
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("scope value", e))
    }

    pub async fn list_values(&self, scope_type_id: Uuid) -> Result<Vec<ScopeValueRow>> {
        sqlx::query_as::<_, ScopeValueRow>(
            "SELECT id, scope_type_id, value FROM scope_values
             WHERE scope_type_id = $1 ORDER BY value",
        )
        .bind(scope_type_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("scope values", e))
    }

    /// Delete a value; refused while any node tag references it
    pub async fn delete_value(&self, id: Uuid) -> Result<()> {
        let referenced: i64 =
            sqlx::query_scalar("SELECT count(*) FROM node_tags WHERE scope_value_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| map_sqlx("scope value references", e))?;
        if referenced > 0 {
            return Err(Error::Conflict("scope value is referenced by node tags".into()));
        }

        let result = sqlx::query("DELETE FROM scope_values WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("scope value", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("scope value".into()));
        }
        Ok(())
    }
}
