//! Composite configuration repository

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::error::map_sqlx;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CompositeRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub entry_point: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CompositeVersionRow {
    pub id: Uuid,
    pub composite_id: Uuid,
    pub version: String,
    pub is_draft: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// One child reference inside a composite version
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CompositeItemRow {
    pub id: Uuid,
    pub composite_version_id: Uuid,
    pub child_configuration_id: Uuid,
    pub pinned_version: Option<String>,
    pub item_order: i32,
}

/// Input for one child when creating a composite version
#[derive(Debug, Clone)]
pub struct NewItem {
    pub child_configuration_id: Uuid,
    pub pinned_version: Option<String>,
    pub item_order: i32,
}

#[derive(Clone)]
pub struct CompositeRepo {
    pool: PgPool,
}

impl CompositeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, name: &str, description: &str, entry_point: &str) -> Result<CompositeRow> {
        sqlx::query_as::<_, CompositeRow>(
            r#"
            INSERT INTO composite_configurations (id, name, description, entry_point)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, description, entry_point, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(entry_point)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(&format!("composite {}", name), e))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<CompositeRow>> {
        sqlx::query_as::<_, CompositeRow>(
            "SELECT id, name, description, entry_point, created_at
             FROM composite_configurations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("composite", e))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<CompositeRow>> {
        sqlx::query_as::<_, CompositeRow>(
            "SELECT id, name, description, entry_point, created_at
             FROM composite_configurations WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("composite", e))
    }

    pub async fn list(&self) -> Result<Vec<CompositeRow>> {
        sqlx::query_as::<_, CompositeRow>(
            "SELECT id, name, description, entry_point, created_at
             FROM composite_configurations ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("composites", e))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let referenced: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM node_configurations WHERE composite_id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("composite references", e))?;
        if referenced > 0 {
            return Err(Error::Conflict("composite is assigned to a node".into()));
        }

        let result = sqlx::query("DELETE FROM composite_configurations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("composite", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("composite".into()));
        }
        Ok(())
    }

    /// Insert a composite version with its ordered items in one transaction
    pub async fn create_version(
        &self,
        composite_id: Uuid,
        version: &str,
        is_draft: bool,
        created_by: &str,
        items: &[NewItem],
    ) -> Result<CompositeVersionRow> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("begin", e))?;

        let row = sqlx::query_as::<_, CompositeVersionRow>(
            r#"
            INSERT INTO composite_configuration_versions (id, composite_id, version, is_draft, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, composite_id, version, is_draft, is_archived, created_at, created_by
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(composite_id)
        .bind(version)
        .bind(is_draft)
        .bind(created_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx(&format!("composite version {}", version), e))?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO composite_configuration_items
                    (id, composite_version_id, child_configuration_id, pinned_version, item_order)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(row.id)
            .bind(item.child_configuration_id)
            .bind(&item.pinned_version)
            .bind(item.item_order)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx("composite item", e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx("commit", e))?;
        Ok(row)
    }

    pub async fn get_version(
        &self,
        composite_id: Uuid,
        version: &str,
    ) -> Result<Option<CompositeVersionRow>> {
        sqlx::query_as::<_, CompositeVersionRow>(
            "SELECT id, composite_id, version, is_draft, is_archived, created_at, created_by
             FROM composite_configuration_versions
             WHERE composite_id = $1 AND version = $2",
        )
        .bind(composite_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("composite version", e))
    }

    pub async fn list_versions(&self, composite_id: Uuid) -> Result<Vec<CompositeVersionRow>> {
        sqlx::query_as::<_, CompositeVersionRow>(
            "SELECT id, composite_id, version, is_draft, is_archived, created_at, created_by
             FROM composite_configuration_versions
             WHERE composite_id = $1 ORDER BY created_at",
        )
        .bind(composite_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("composite versions", e))
    }

    pub async fn publish_version(&self, composite_id: Uuid, version: &str) -> Result<CompositeVersionRow> {
        let existing = self
            .get_version(composite_id, version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("composite version {}", version)))?;
        if existing.is_archived {
            return Err(Error::Archived(format!("composite version {} is archived", version)));
        }
        if !existing.is_draft {
            return Err(Error::Conflict(format!(
                "composite version {} is already published",
                version
            )));
        }

        sqlx::query_as::<_, CompositeVersionRow>(
            r#"
            UPDATE composite_configuration_versions SET is_draft = FALSE
            WHERE id = $1
            RETURNING id, composite_id, version, is_draft, is_archived, created_at, created_by
            "#,
        )
        .bind(existing.id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("publish composite", e))
    }

    pub async fn items_for_version(&self, composite_version_id: Uuid) -> Result<Vec<CompositeItemRow>> {
        sqlx::query_as::<_, CompositeItemRow>(
            "SELECT id, composite_version_id, child_configuration_id, pinned_version, item_order
             FROM composite_configuration_items
             WHERE composite_version_id = $1 ORDER BY item_order",
        )
        .bind(composite_version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("composite items", e))
    }

    /// All items of every composite version; feeds the in-use computation
    pub async fn list_all_items(&self) -> Result<Vec<CompositeItemRow>> {
        sqlx::query_as::<_, CompositeItemRow>(
            "SELECT id, composite_version_id, child_configuration_id, pinned_version, item_order
             FROM composite_configuration_items ORDER BY composite_version_id, item_order",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("composite items", e))
    }
}
