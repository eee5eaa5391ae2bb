//! Composite configuration endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use opendsc_core::naming::validate_name;
use opendsc_core::version::Version;
use opendsc_core::Error;
use opendsc_storage::postgres::auth::LEVEL_MANAGE;
use opendsc_storage::postgres::composites::{CompositeRow, NewItem};

use crate::auth::identity::Operator;
use crate::auth::permissions::{require_global, require_resource, Level, ResourceKind};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateCompositeRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "entryPoint")]
    pub entry_point: String,
}

/// `GET /composite-configurations`
pub async fn list(
    State(state): State<AppState>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    let mut visible: Vec<CompositeRow> = Vec::new();
    for composite in state.repos.composites.list().await? {
        let allowed = require_resource(
            &state,
            &operator.claims,
            ResourceKind::CompositeConfiguration,
            composite.id,
            Level::Read,
        )
        .await
        .is_ok();
        if allowed {
            visible.push(composite);
        }
    }
    Ok(Json(json!({ "composites": visible })))
}

/// `POST /composite-configurations`
pub async fn create(
    State(state): State<AppState>,
    operator: Operator,
    Json(request): Json<CreateCompositeRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_global(&operator.claims, "configurations.create")?;
    validate_name(&request.name)?;

    let composite = state
        .repos
        .composites
        .create(&request.name, &request.description, &request.entry_point)
        .await?;

    state
        .repos
        .auth
        .grant_resource_permission(
            operator.claims.user_id,
            "User",
            ResourceKind::CompositeConfiguration.as_str(),
            composite.id,
            LEVEL_MANAGE,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "composite": composite }))))
}

/// `DELETE /composite-configurations/{name}`
pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    let composite = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::CompositeConfiguration,
        composite.id,
        Level::Manage,
    )
    .await?;

    state.repos.composites.delete(composite.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct CompositeItemRequest {
    /// Name of a non-composite configuration
    pub configuration: String,
    /// Pin to this version; absent resolves latest published at bundle time
    #[serde(rename = "pinnedVersion")]
    pub pinned_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateCompositeVersionRequest {
    pub version: String,
    #[serde(rename = "isDraft", default = "default_true")]
    pub is_draft: bool,
    /// Children in application order
    pub items: Vec<CompositeItemRequest>,
}

fn default_true() -> bool {
    true
}

/// `GET /composite-configurations/{name}/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    let composite = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::CompositeConfiguration,
        composite.id,
        Level::Read,
    )
    .await?;

    let versions = state.repos.composites.list_versions(composite.id).await?;
    Ok(Json(json!({ "versions": versions })))
}

/// `POST /composite-configurations/{name}/versions`
pub async fn create_version(
    State(state): State<AppState>,
    Path(name): Path<String>,
    operator: Operator,
    Json(request): Json<CreateCompositeVersionRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let composite = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::CompositeConfiguration,
        composite.id,
        Level::Modify,
    )
    .await?;

    let version = request
        .version
        .parse::<Version>()
        .map_err(ApiError)?;
    if request.items.is_empty() {
        return Err(ApiError(Error::Validation(
            "a composite version needs at least one child".into(),
        )));
    }

    let mut items = Vec::with_capacity(request.items.len());
    for (index, item) in request.items.iter().enumerate() {
        // Children must be plain configurations; composites cannot nest.
        let child = state
            .repos
            .configurations
            .get_by_name(&item.configuration)
            .await?
            .ok_or_else(|| {
                ApiError(Error::NotFound(format!("configuration {}", item.configuration)))
            })?;

        if let Some(pinned) = &item.pinned_version {
            state
                .repos
                .configurations
                .get_version(child.id, pinned)
                .await?
                .ok_or_else(|| {
                    ApiError(Error::NotFound(format!(
                        "configuration {} has no version {}",
                        item.configuration, pinned
                    )))
                })?;
        }

        items.push(NewItem {
            child_configuration_id: child.id,
            pinned_version: item.pinned_version.clone(),
            item_order: index as i32 + 1,
        });
    }

    let created = state
        .repos
        .composites
        .create_version(
            composite.id,
            &version.to_string(),
            request.is_draft,
            &operator.claims.username,
            &items,
        )
        .await?;

    tracing::info!(name = %name, version = %created.version, "composite version created");

    Ok((StatusCode::CREATED, Json(json!({ "version": created }))))
}

/// `PUT /composite-configurations/{name}/versions/{version}/publish`
pub async fn publish(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    let composite = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::CompositeConfiguration,
        composite.id,
        Level::Modify,
    )
    .await?;

    let published = state
        .repos
        .composites
        .publish_version(composite.id, &version)
        .await?;
    Ok(Json(json!({ "version": published })))
}

/// `GET /composite-configurations/{name}/versions/{version}/items`
///
/// Composite read implies read of the referenced children for listing.
pub async fn list_items(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    let composite = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::CompositeConfiguration,
        composite.id,
        Level::Read,
    )
    .await?;

    let row = state
        .repos
        .composites
        .get_version(composite.id, &version)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound(format!("composite version {}", version))))?;

    let items = state.repos.composites.items_for_version(row.id).await?;
    let mut listed = Vec::with_capacity(items.len());
    for item in items {
        let child = state
            .repos
            .configurations
            .get(item.child_configuration_id)
            .await?;
        listed.push(json!({
            "configuration": child.map(|c| c.name),
            "pinnedVersion": item.pinned_version,
            "order": item.item_order,
        }));
    }

    Ok(Json(json!({ "items": listed })))
}

async fn lookup(state: &AppState, name: &str) -> Result<CompositeRow, ApiError> {
    state
        .repos
        .composites
        .get_by_name(name)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound(format!("composite {}", name))))
}
