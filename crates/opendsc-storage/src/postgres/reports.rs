//! Compliance report repository; append-only

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use opendsc_core::Result;

use crate::error::map_sqlx;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ReportRow {
    pub id: Uuid,
    pub node_id: Uuid,
    pub operation: String,
    pub exit_code: i32,
    pub in_desired_state: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub submitted_at: DateTime<Utc>,
    pub result: serde_json::Value,
}

#[derive(Clone)]
pub struct ReportRepo {
    pool: PgPool,
}

impl ReportRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn append(
        &self,
        node_id: Uuid,
        operation: &str,
        exit_code: i32,
        in_desired_state: bool,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        result: &serde_json::Value,
    ) -> Result<ReportRow> {
        sqlx::query_as::<_, ReportRow>(
            r#"
            INSERT INTO compliance_reports
                (id, node_id, operation, exit_code, in_desired_state, started_at, ended_at, result)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id, node_id, operation, exit_code, in_desired_state,
                      started_at, ended_at, submitted_at, result
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(node_id)
        .bind(operation)
        .bind(exit_code)
        .bind(in_desired_state)
        .bind(started_at)
        .bind(ended_at)
        .bind(result)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx("compliance report", e))
    }

    pub async fn list_for_node(&self, node_id: Uuid, limit: i64) -> Result<Vec<ReportRow>> {
        sqlx::query_as::<_, ReportRow>(
            r#"
            SELECT id, node_id, operation, exit_code, in_desired_state,
                   started_at, ended_at, submitted_at, result
            FROM compliance_reports
            WHERE node_id = $1
            ORDER BY submitted_at DESC
            LIMIT $2
            "#,
        )
        .bind(node_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx("compliance reports", e))
    }
}
