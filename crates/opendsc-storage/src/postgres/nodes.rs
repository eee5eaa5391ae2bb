//! Node, node tag, and node assignment repository

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::{Error, Result};

use crate::error::map_sqlx;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NodeRow {
    pub id: Uuid,
    pub fqdn: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
    pub cert_fingerprint: Option<String>,
    pub cert_not_after: Option<DateTime<Utc>>,
}

/// A node tag joined with its scope type and value
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct NodeTagRow {
    pub node_id: Uuid,
    pub scope_type_id: Uuid,
    pub scope_type_name: String,
    pub precedence: i32,
    pub scope_value_id: Uuid,
    pub scope_value: String,
}

/// A node's configuration assignment
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct AssignmentRow {
    pub node_id: Uuid,
    pub configuration_id: Option<Uuid>,
    pub composite_id: Option<Uuid>,
    pub pinned_version: Option<String>,
    pub use_server_managed_parameters: bool,
}

#[derive(Clone)]
pub struct NodeRepo {
    pool: PgPool,
}

impl NodeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a node with its certificate binding
    pub async fn insert(
        &self,
        fqdn: &str,
        cert_fingerprint: &str,
        cert_not_after: DateTime<Utc>,
    ) -> Result<NodeRow> {
        sqlx::query_as::<_, NodeRow>(
            r#"
            INSERT INTO nodes (id, fqdn, cert_fingerprint, cert_not_after)
            VALUES ($1, $2, $3, $4)
            RETURNING id, fqdn, registered_at, last_seen, cert_fingerprint, cert_not_after
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(fqdn)
        .bind(cert_fingerprint)
        .bind(cert_not_after)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx(&format!("node {}", fqdn), e))
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<NodeRow>> {
        sqlx::query_as::<_, NodeRow>(
            "SELECT id, fqdn, registered_at, last_seen, cert_fingerprint, cert_not_after
             FROM nodes WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("node", e))
    }

    pub async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<NodeRow>> {
        sqlx::query_as::<_, NodeRow>(
            "SELECT id, fqdn, registered_at, last_seen, cert_fingerprint, cert_not_after
             FROM nodes WHERE cert_fingerprint = $1",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("node", e))
    }

    pub async fn list(&self) -> Result<Vec<NodeRow>> {
        sqlx::query_as::<_, NodeRow>(
            "SELECT id, fqdn, registered_at, last_seen, cert_fingerprint, cert_not_after
             FROM nodes ORDER BY fqdn",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("nodes", e))
    }

    pub async fn touch_last_seen(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE nodes SET last_seen = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("node", e))?;
        Ok(())
    }

    /// Swap the stored fingerprint; the update only applies while the
    /// current fingerprint still matches, so concurrent rotations conflict
    /// instead of clobbering each other
    pub async fn rotate_fingerprint(
        &self,
        id: Uuid,
        current_fingerprint: &str,
        new_fingerprint: &str,
        new_not_after: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE nodes SET cert_fingerprint = $1, cert_not_after = $2
             WHERE id = $3 AND cert_fingerprint = $4",
        )
        .bind(new_fingerprint)
        .bind(new_not_after)
        .bind(id)
        .bind(current_fingerprint)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("rotate certificate", e))?;

        if result.rows_affected() == 0 {
            return Err(Error::Conflict(
                "node certificate changed concurrently or node is unknown".into(),
            ));
        }
        Ok(())
    }

    /// Delete a node; tags and assignments cascade
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("node", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("node".into()));
        }
        Ok(())
    }

    /// Tag a node with a scope value, replacing any prior value of the same
    /// scope type
    pub async fn tag(&self, node_id: Uuid, scope_type_id: Uuid, scope_value_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO node_tags (id, node_id, scope_type_id, scope_value_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (node_id, scope_type_id)
            DO UPDATE SET scope_value_id = EXCLUDED.scope_value_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(node_id)
        .bind(scope_type_id)
        .bind(scope_value_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("node tag", e))?;
        Ok(())
    }

    pub async fn untag(&self, node_id: Uuid, scope_type_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM node_tags WHERE node_id = $1 AND scope_type_id = $2",
        )
        .bind(node_id)
        .bind(scope_type_id)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("node tag", e))?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("node tag".into()));
        }
        Ok(())
    }

    /// Tags joined with scope metadata, ordered by ascending precedence
    pub async fn tags_for(&self, node_id: Uuid) -> Result<Vec<NodeTagRow>> {
        sqlx::query_as::<_, NodeTagRow>(
            r#"
            SELECT t.node_id, t.scope_type_id, st.name AS scope_type_name,
                   st.precedence, t.scope_value_id, sv.value AS scope_value
            FROM node_tags t
            JOIN scope_types st ON st.id = t.scope_type_id
            JOIN scope_values sv ON sv.id = t.scope_value_id
            WHERE t.node_id = $1
            ORDER BY st.precedence
            "#,
        )
        .bind(node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("node tags", e))
    }

    /// Assign a configuration or composite (exactly one), replacing any
    /// prior assignment
    pub async fn assign(
        &self,
        node_id: Uuid,
        configuration_id: Option<Uuid>,
        composite_id: Option<Uuid>,
        pinned_version: Option<&str>,
        use_server_managed_parameters: bool,
    ) -> Result<()> {
        if configuration_id.is_some() == composite_id.is_some() {
            return Err(Error::Validation(
                "exactly one of configuration or composite must be assigned".into(),
            ));
        }

        sqlx::query(
            r#"
            INSERT INTO node_configurations
                (id, node_id, configuration_id, composite_id, pinned_version, use_server_managed_parameters)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (node_id) DO UPDATE SET
                configuration_id = EXCLUDED.configuration_id,
                composite_id = EXCLUDED.composite_id,
                pinned_version = EXCLUDED.pinned_version,
                use_server_managed_parameters = EXCLUDED.use_server_managed_parameters,
                assigned_at = now()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(node_id)
        .bind(configuration_id)
        .bind(composite_id)
        .bind(pinned_version)
        .bind(use_server_managed_parameters)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx("node assignment", e))?;
        Ok(())
    }

    pub async fn assignment_for(&self, node_id: Uuid) -> Result<Option<AssignmentRow>> {
        sqlx::query_as::<_, AssignmentRow>(
            "SELECT node_id, configuration_id, composite_id, pinned_version, use_server_managed_parameters
             FROM node_configurations WHERE node_id = $1",
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx("node assignment", e))
    }

    /// Every assignment; feeds the retention in-use computation
    pub async fn list_assignments(&self) -> Result<Vec<AssignmentRow>> {
        sqlx::query_as::<_, AssignmentRow>(
            "SELECT node_id, configuration_id, composite_id, pinned_version, use_server_managed_parameters
             FROM node_configurations",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("node assignments", e))
    }
}
