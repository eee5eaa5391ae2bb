//! Scope type and scope value endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use opendsc_core::naming::validate_name;

use crate::auth::identity::Operator;
use crate::auth::permissions::require_global;
use crate::error::ApiResult;
use crate::state::AppState;

/// `GET /scope-types`
pub async fn list(
    State(state): State<AppState>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_global(&operator.claims, "scopes.read")?;
    let types = state.repos.scopes.list_types().await?;
    Ok(Json(json!({ "scopeTypes": types })))
}

#[derive(Debug, Deserialize)]
pub struct CreateScopeTypeRequest {
    pub name: String,
    pub precedence: i32,
    #[serde(rename = "allowsValues", default = "default_true")]
    pub allows_values: bool,
}

fn default_true() -> bool {
    true
}

/// `POST /scope-types`
pub async fn create(
    State(state): State<AppState>,
    operator: Operator,
    Json(request): Json<CreateScopeTypeRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_global(&operator.claims, "scopes.manage")?;
    validate_name(&request.name)?;

    let created = state
        .repos
        .scopes
        .create_type(&request.name, request.precedence, request.allows_values)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "scopeType": created }))))
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    /// The complete desired precedence map
    pub precedences: Vec<ReorderEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderEntry {
    pub id: Uuid,
    pub precedence: i32,
}

/// `PUT /scope-types/reorder`: atomic full-map precedence rewrite
pub async fn reorder(
    State(state): State<AppState>,
    operator: Operator,
    Json(request): Json<ReorderRequest>,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "scopes.manage")?;

    let desired: Vec<(Uuid, i32)> = request
        .precedences
        .iter()
        .map(|entry| (entry.id, entry.precedence))
        .collect();
    state.repos.scopes.reorder(&desired).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /scope-types/{id}`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "scopes.manage")?;
    state.repos.scopes.delete_type(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AddValueRequest {
    pub value: String,
}

/// `POST /scope-types/{id}/values`
pub async fn add_value(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
    Json(request): Json<AddValueRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_global(&operator.claims, "scopes.manage")?;
    validate_name(&request.value)?;

    let created = state.repos.scopes.add_value(id, &request.value).await?;
    Ok((StatusCode::CREATED, Json(json!({ "scopeValue": created }))))
}

/// `GET /scope-types/{id}/values`
pub async fn list_values(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_global(&operator.claims, "scopes.read")?;
    let values = state.repos.scopes.list_values(id).await?;
    Ok(Json(json!({ "scopeValues": values })))
}

/// `DELETE /scope-types/{id}/values/{value_id}`
pub async fn remove_value(
    State(state): State<AppState>,
    Path((_id, value_id)): Path<(Uuid, Uuid)>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "scopes.manage")?;
    state.repos.scopes.delete_value(value_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
