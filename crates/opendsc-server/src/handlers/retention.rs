//! Retention endpoints

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::auth::identity::Operator;
use crate::auth::permissions::require_global;
use crate::error::ApiResult;
use crate::services::retention::{self, RetentionPolicy};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CleanupRequest {
    #[serde(rename = "keepVersions")]
    pub keep_versions: Option<usize>,
    #[serde(rename = "keepDays")]
    pub keep_days: Option<u32>,
    #[serde(rename = "dryRun", default = "default_dry_run")]
    pub dry_run: bool,
}

fn default_dry_run() -> bool {
    true
}

impl CleanupRequest {
    fn policy(&self, state: &AppState) -> RetentionPolicy {
        RetentionPolicy {
            keep_versions: self
                .keep_versions
                .unwrap_or(state.config.retention.keep_versions as usize),
            keep_days: self.keep_days.unwrap_or(state.config.retention.keep_days),
            dry_run: self.dry_run,
        }
    }
}

/// `POST /retention/configurations/cleanup`
pub async fn configurations_cleanup(
    State(state): State<AppState>,
    operator: Operator,
    Json(request): Json<CleanupRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_global(&operator.claims, "retention.run")?;

    let report = retention::run_configuration_retention(&state, request.policy(&state)).await?;
    Ok(Json(json!({ "report": report })))
}

/// `POST /retention/parameters/cleanup`
pub async fn parameters_cleanup(
    State(state): State<AppState>,
    operator: Operator,
    Json(request): Json<CleanupRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    require_global(&operator.claims, "retention.run")?;

    let report = retention::run_parameter_retention(&state, request.policy(&state)).await?;
    Ok(Json(json!({ "report": report })))
}
