//! Parameter file and parameter schema repository
//!
//! Parameter bytes live in the content store; rows carry the content hash
//! and a reference to the deduplicated schema row. Activation is strictly
//! serialized per (configuration, scope type, scope value): a single
//! transaction deactivates the current active record and activates the
//! target, and a partial unique index backs the invariant.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::error::map_sqlx;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ParameterFileRow {
    pub id: Uuid,
    pub configuration_id: Uuid,
    pub scope_type_id: Uuid,
    pub scope_value_id: Option<Uuid>,
    pub version: String,
    pub content_hash: String,
    pub content_type: String,
    pub schema_hash: String,
    pub is_draft: bool,
    pub is_active: bool,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ParameterSchemaRow {
    pub hash: String,
    pub schema: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// One resolved merge source for a node and configuration
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MergeSourceRow {
    pub scope_type_name: String,
    pub scope_value: Option<String>,
    pub precedence: i32,
    pub content_hash: String,
    pub content_type: String,
}

#[derive(Clone)]
pub struct ParameterRepo {
    pool: PgPool,
}

impl ParameterRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a schema if its hash is new; existing hashes are shared
    pub async fn upsert_schema(&self, hash: &str, schema: &serde_json::Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO parameter_schemas (hash, schema) VALUES ($1, $2)
             ON CONFLICT (hash) DO NOTHING",
        )
        .bind(hash)
        .bind(schema)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("parameter schema", e))?;
        Ok(())
    }

    pub async fn get_schema(&self, hash: &str) -> Result<Option<ParameterSchemaRow>> {
        sqlx::query_as::<_, ParameterSchemaRow>(
            "SELECT hash, schema, created_at FROM parameter_schemas WHERE hash = $1",
        )
        .bind(hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("parameter schema", e))
    }

    pub async fn count_schemas_with_hash(&self, hash: &str) -> Result<i64> {
        sqlx::query_scalar("SELECT count(*) FROM parameter_schemas WHERE hash = $1")
            .bind(hash)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx("parameter schema", e))
    }

    /// Drop schema rows no parameter file references any more
    pub async fn collect_orphan_schemas(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM parameter_schemas s
             WHERE NOT EXISTS (SELECT 1 FROM parameter_files f WHERE f.schema_hash = s.hash)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("orphan schemas", e))?;
        Ok(result.rows_affected())
    }

    /// Insert a new draft parameter version
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        &self,
        configuration_id: Uuid,
        scope_type_id: Uuid,
        scope_value_id: Option<Uuid>,
        version: &str,
        content_hash: &str,
        content_type: &str,
        schema_hash: &str,
        is_draft: bool,
        created_by: &str,
    ) -> Result<ParameterFileRow> {
        sqlx::query_as::<_, ParameterFileRow>(
            r#"
            INSERT INTO parameter_files
                (id, configuration_id, scope_type_id, scope_value_id, version,
                 content_hash, content_type, schema_hash, is_draft, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, configuration_id, scope_type_id, scope_value_id, version,
                      content_hash, content_type, schema_hash, is_draft, is_active,
                      is_archived, created_at, created_by
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(configuration_id)
        .bind(scope_type_id)
        .bind(scope_value_id)
        .bind(version)
        .bind(content_hash)
        .bind(content_type)
        .bind(schema_hash)
        .bind(is_draft)
        .bind(created_by)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(&format!("parameter version {}", version), e))
    }

    /// Activate one version, deactivating the current active record of the
    /// same (configuration, scope type, scope value) in the same transaction
    pub async fn activate(
        &self,
        configuration_id: Uuid,
        scope_type_id: Uuid,
        scope_value_id: Option<Uuid>,
        version: &str,
    ) -> Result<ParameterFileRow> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("begin", e))?;

        let target = sqlx::query_as::<_, ParameterFileRow>(
            r#"
            SELECT id, configuration_id, scope_type_id, scope_value_id, version,
                   content_hash, content_type, schema_hash, is_draft, is_active,
                   is_archived, created_at, created_by
            FROM parameter_files
            WHERE configuration_id = $1 AND scope_type_id = $2
              AND scope_value_id IS NOT DISTINCT FROM $3 AND version = $4
            FOR UPDATE
            "#,
        )
        .bind(configuration_id)
        .bind(scope_type_id)
        .bind(scope_value_id)
        .bind(version)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx("parameter version", e))?
        .ok_or_else(|| Error::NotFound(format!("parameter version {}", version)))?;

        if target.is_archived {
            return Err(Error::Archived(format!("parameter version {} is archived", version)));
        }

        sqlx::query(
            r#"
            UPDATE parameter_files SET is_active = FALSE
            WHERE configuration_id = $1 AND scope_type_id = $2
              AND scope_value_id IS NOT DISTINCT FROM $3 AND is_active
            "#,
        )
        .bind(configuration_id)
        .bind(scope_type_id)
        .bind(scope_value_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx("deactivate parameters", e))?;

        let activated = sqlx::query_as::<_, ParameterFileRow>(
            r#"
            UPDATE parameter_files SET is_active = TRUE, is_draft = FALSE
            WHERE id = $1
            RETURNING id, configuration_id, scope_type_id, scope_value_id, version,
                      content_hash, content_type, schema_hash, is_draft, is_active,
                      is_archived, created_at, created_by
            "#,
        )
        .bind(target.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx("activate parameters", e))?;

        tx.commit().await.map_err(|e| map_sqlx("commit", e))?;
        Ok(activated)
    }

    /// The active record for one (configuration, scope type, scope value)
    pub async fn active_for(
        &self,
        configuration_id: Uuid,
        scope_type_id: Uuid,
        scope_value_id: Option<Uuid>,
    ) -> Result<Option<ParameterFileRow>> {
        sqlx::query_as::<_, ParameterFileRow>(
            r#"
            SELECT id, configuration_id, scope_type_id, scope_value_id, version,
                   content_hash, content_type, schema_hash, is_draft, is_active,
                   is_archived, created_at, created_by
            FROM parameter_files
            WHERE configuration_id = $1 AND scope_type_id = $2
              AND scope_value_id IS NOT DISTINCT FROM $3 AND is_active
            "#,
        )
        .bind(configuration_id)
        .bind(scope_type_id)
        .bind(scope_value_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("active parameters", e))
    }

    /// Every version for one (configuration, scope type, scope value)
    pub async fn list_versions(
        &self,
        configuration_id: Uuid,
        scope_type_id: Uuid,
        scope_value_id: Option<Uuid>,
    ) -> Result<Vec<ParameterFileRow>> {
        sqlx::query_as::<_, ParameterFileRow>(
            r#"
            SELECT id, configuration_id, scope_type_id, scope_value_id, version,
                   content_hash, content_type, schema_hash, is_draft, is_active,
                   is_archived, created_at, created_by
            FROM parameter_files
            WHERE configuration_id = $1 AND scope_type_id = $2
              AND scope_value_id IS NOT DISTINCT FROM $3
            ORDER BY created_at
            "#,
        )
        .bind(configuration_id)
        .bind(scope_type_id)
        .bind(scope_value_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("parameter versions", e))
    }

    /// Resolve every merge source for a node and configuration in one
    /// statement: the Default scope, the node's tagged scopes, and the Node
    /// scope keyed by FQDN, ordered by ascending precedence
    ///
    /// Running as a single statement gives the merge service a consistent
    /// snapshot of tags and active flags without holding locks across file
    /// I/O.
    pub async fn merge_sources(
        &self,
        configuration_id: Uuid,
        node_id: Uuid,
        fqdn: &str,
    ) -> Result<Vec<MergeSourceRow>> {
        sqlx::query_as::<_, MergeSourceRow>(
            r#"
            SELECT st.name AS scope_type_name, NULL::text AS scope_value,
                   st.precedence, pf.content_hash, pf.content_type
            FROM parameter_files pf
            JOIN scope_types st ON st.id = pf.scope_type_id
            WHERE pf.configuration_id = $1 AND st.name = 'Default' AND pf.is_active
            UNION ALL
            SELECT st.name, sv.value, st.precedence, pf.content_hash, pf.content_type
            FROM node_tags t
            JOIN scope_types st ON st.id = t.scope_type_id
            JOIN scope_values sv ON sv.id = t.scope_value_id
            JOIN parameter_files pf
              ON pf.configuration_id = $1 AND pf.scope_type_id = st.id
             AND pf.scope_value_id = sv.id AND pf.is_active
            WHERE t.node_id = $2
            UNION ALL
            SELECT st.name, sv.value, st.precedence, pf.content_hash, pf.content_type
            FROM scope_types st
            JOIN scope_values sv ON sv.scope_type_id = st.id AND sv.value = $3
            JOIN parameter_files pf
              ON pf.configuration_id = $1 AND pf.scope_type_id = st.id
             AND pf.scope_value_id = sv.id AND pf.is_active
            WHERE st.name = 'Node'
            ORDER BY precedence
            "#,
        )
        .bind(configuration_id)
        .bind(node_id)
        .bind(fqdn)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("merge sources", e))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM parameter_files WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("parameter file", e))?;
        Ok(())
    }
}
