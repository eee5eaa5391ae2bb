//! Configuration and version repository

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::error::map_sqlx;

/// A configuration row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ConfigurationRow {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub entry_point: String,
    pub is_server_managed: bool,
    pub created_at: DateTime<Utc>,
}

/// A configuration version row
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VersionRow {
    pub id: Uuid,
    pub configuration_id: Uuid,
    pub version: String,
    pub is_draft: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// A file belonging to a version; bytes live in the content store
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FileRow {
    pub id: Uuid,
    pub version_id: Uuid,
    pub path: String,
    pub content_hash: String,
    pub size_bytes: i64,
}

/// Input for one uploaded file
#[derive(Debug, Clone)]
pub struct NewFile {
    pub path: String,
    pub content_hash: String,
    pub size_bytes: i64,
}

#[derive(Clone)]
pub struct ConfigurationRepo {
    pool: PgPool,
}

impl ConfigurationRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        name: &str,
        description: &str,
        entry_point: &str,
        is_server_managed: bool,
    ) -> Result<ConfigurationRow> {
        sqlx::query_as::<_, ConfigurationRow>(
            r#"
            INSERT INTO configurations (id, name, description, entry_point, is_server_managed)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, name, description, entry_point, is_server_managed, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(description)
        .bind(entry_point)
        .bind(is_server_managed)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(&format!("configuration {}", name), e))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ConfigurationRow>> {
        sqlx::query_as::<_, ConfigurationRow>(
            "SELECT id, name, description, entry_point, is_server_managed, created_at
             FROM configurations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("configuration", e))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<ConfigurationRow>> {
        sqlx::query_as::<_, ConfigurationRow>(
            "SELECT id, name, description, entry_point, is_server_managed, created_at
             FROM configurations WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("configuration", e))
    }

    pub async fn list(&self) -> Result<Vec<ConfigurationRow>> {
        sqlx::query_as::<_, ConfigurationRow>(
            "SELECT id, name, description, entry_point, is_server_managed, created_at
             FROM configurations ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("configurations", e))
    }

    /// Delete a configuration; refused while any node assignment references
    /// it
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let referenced: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM node_configurations WHERE configuration_id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("configuration references", e))?;
        let composite_refs: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM composite_configuration_items WHERE child_configuration_id = $1",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("configuration references", e))?;
        if referenced + composite_refs > 0 {
            return Err(Error::Conflict(
                "configuration is assigned or referenced by a composite".into(),
            ));
        }

        let result = sqlx::query("DELETE FROM configurations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("configuration", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("configuration".into()));
        }
        Ok(())
    }

    /// Insert a version and its file rows in one transaction
    pub async fn create_version(
        &self,
        configuration_id: Uuid,
        version: &str,
        is_draft: bool,
        created_by: &str,
        files: &[NewFile],
    ) -> Result<VersionRow> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("begin", e))?;

        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            INSERT INTO configuration_versions (id, configuration_id, version, is_draft, created_by)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, configuration_id, version, is_draft, is_archived, created_at, created_by
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(configuration_id)
        .bind(version)
        .bind(is_draft)
        .bind(created_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx(&format!("version {}", version), e))?;

        for file in files {
            sqlx::query(
                "INSERT INTO configuration_files (id, version_id, path, content_hash, size_bytes)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(Uuid::new_v4())
            .bind(row.id)
            .bind(&file.path)
            .bind(&file.content_hash)
            .bind(file.size_bytes)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(&format!("file {}", file.path), e))?;
        }

        tx.commit().await.map_err(|e| map_sqlx("commit", e))?;
        Ok(row)
    }

    pub async fn get_version(
        &self,
        configuration_id: Uuid,
        version: &str,
    ) -> Result<Option<VersionRow>> {
        sqlx::query_as::<_, VersionRow>(
            "SELECT id, configuration_id, version, is_draft, is_archived, created_at, created_by
             FROM configuration_versions WHERE configuration_id = $1 AND version = $2",
        )
        .bind(configuration_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("version", e))
    }

    pub async fn list_versions(&self, configuration_id: Uuid) -> Result<Vec<VersionRow>> {
        sqlx::query_as::<_, VersionRow>(
            "SELECT id, configuration_id, version, is_draft, is_archived, created_at, created_by
             FROM configuration_versions WHERE configuration_id = $1 ORDER BY created_at",
        )
        .bind(configuration_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("versions", e))
    }

    /// Publish a draft; archived versions refuse, published versions conflict
    pub async fn publish_version(&self, configuration_id: Uuid, version: &str) -> Result<VersionRow> {
        let existing = self
            .get_version(configuration_id, version)
            .await?
            .ok_or_else(|| Error::NotFound(format!("version {}", version)))?;
        if existing.is_archived {
            return Err(Error::Archived(format!("version {} is archived", version)));
        }
        if !existing.is_draft {
            return Err(Error::Conflict(format!("version {} is already published", version)));
        }

        sqlx::query_as::<_, VersionRow>(
            r#"
            UPDATE configuration_versions SET is_draft = FALSE
            WHERE id = $1
            RETURNING id, configuration_id, version, is_draft, is_archived, created_at, created_by
            "#,
        )
        .bind(existing.id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("publish", e))
    }

    pub async fn archive_version(&self, configuration_id: Uuid, version: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE configuration_versions SET is_archived = TRUE
             WHERE configuration_id = $1 AND version = $2",
        )
        .bind(configuration_id)
        .bind(version)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("archive", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("version {}", version)));
        }
        Ok(())
    }

    /// Delete the metadata row of a version; file rows cascade
    pub async fn delete_version(&self, version_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM configuration_versions WHERE id = $1")
            .bind(version_id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("delete version", e))?;
        Ok(())
    }

    pub async fn files_for_version(&self, version_id: Uuid) -> Result<Vec<FileRow>> {
        sqlx::query_as::<_, FileRow>(
            "SELECT id, version_id, path, content_hash, size_bytes
             FROM configuration_files WHERE version_id = $1 ORDER BY path",
        )
        .bind(version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("files", e))
    }

    /// Content hashes still referenced by any file row; used by retention to
    /// avoid deleting shared blobs
    pub async fn hash_reference_counts(&self, hashes: &[String]) -> Result<Vec<(String, i64)>> {
        sqlx::query_as::<_, (String, i64)>(
            "SELECT content_hash, count(*) FROM configuration_files
             WHERE content_hash = ANY($1) GROUP BY content_hash",
        )
        .bind(hashes)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("hash references", e))
    }
}
