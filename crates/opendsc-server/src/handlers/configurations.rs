//! Configuration store endpoints

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;
use uuid::Uuid;

use opendsc_core::naming::{normalize_relative_path, validate_name};
use opendsc_core::version::Version;
use opendsc_core::Error;
use opendsc_storage::postgres::auth::LEVEL_MANAGE;
use opendsc_storage::postgres::configurations::{ConfigurationRow, NewFile};

use crate::auth::identity::Operator;
use crate::auth::permissions::{require_global, require_resource, Level, ResourceKind};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Parsed multipart payload of a configuration upload
struct UploadPayload {
    fields: std::collections::HashMap<String, String>,
    files: Vec<(String, Vec<u8>)>,
}

async fn read_multipart(mut multipart: Multipart) -> Result<UploadPayload, ApiError> {
    let mut fields = std::collections::HashMap::new();
    let mut files = Vec::new();

    while let Some(part) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError(Error::Validation(format!("multipart: {}", e))))?
    {
        let name = part.name().unwrap_or_default().to_string();
        if name == "files" {
            let path = part
                .file_name()
                .ok_or_else(|| ApiError(Error::Validation("file part without a filename".into())))?
                .to_string();
            let bytes = part
                .bytes()
                .await
                .map_err(|e| ApiError(Error::Validation(format!("multipart: {}", e))))?;
            files.push((path, bytes.to_vec()));
        } else {
            let value = part
                .text()
                .await
                .map_err(|e| ApiError(Error::Validation(format!("multipart: {}", e))))?;
            fields.insert(name, value);
        }
    }

    Ok(UploadPayload { fields, files })
}

/// Validate paths, store bytes, and build file rows
async fn store_files(
    state: &AppState,
    files: &[(String, Vec<u8>)],
) -> Result<Vec<NewFile>, ApiError> {
    if files.is_empty() {
        return Err(ApiError(Error::Validation("at least one file is required".into())));
    }

    let mut rows = Vec::with_capacity(files.len());
    for (raw_path, bytes) in files {
        let path = normalize_relative_path(raw_path)?;
        let content_hash = state.content.put(bytes).await?;
        rows.push(NewFile {
            path,
            content_hash,
            size_bytes: bytes.len() as i64,
        });
    }
    Ok(rows)
}

fn require_field<'a>(payload: &'a UploadPayload, name: &str) -> Result<&'a str, ApiError> {
    payload
        .fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| ApiError(Error::Validation(format!("field {} is required", name))))
}

fn parse_version(raw: &str) -> Result<Version, ApiError> {
    raw.parse::<Version>().map_err(ApiError)
}

/// `GET /configurations`
pub async fn list(
    State(state): State<AppState>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    // Listing filters to what the caller may read.
    let mut visible: Vec<ConfigurationRow> = Vec::new();
    for configuration in state.repos.configurations.list().await? {
        let allowed = require_resource(
            &state,
            &operator.claims,
            ResourceKind::Configuration,
            configuration.id,
            Level::Read,
        )
        .await
        .is_ok();
        if allowed {
            visible.push(configuration);
        }
    }
    Ok(Json(json!({ "configurations": visible })))
}

/// `POST /configurations`: create a configuration with its initial version
pub async fn create(
    State(state): State<AppState>,
    operator: Operator,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_global(&operator.claims, "configurations.create")?;

    let payload = read_multipart(multipart).await?;
    let name = require_field(&payload, "name")?.to_string();
    validate_name(&name)?;
    let entry_point = require_field(&payload, "entryPoint")?.to_string();
    let description = payload.fields.get("description").cloned().unwrap_or_default();
    let version = parse_version(require_field(&payload, "version")?)?;
    let is_draft = payload
        .fields
        .get("isDraft")
        .map(|v| v == "true")
        .unwrap_or(true);
    let is_server_managed = payload
        .fields
        .get("isServerManaged")
        .map(|v| v == "true")
        .unwrap_or(true);

    if !payload.files.iter().any(|(path, _)| path == &entry_point) {
        return Err(ApiError(Error::Validation(format!(
            "entry point {} is not among the uploaded files",
            entry_point
        ))));
    }

    let files = store_files(&state, &payload.files).await?;

    let configuration = state
        .repos
        .configurations
        .create(&name, &description, &entry_point, is_server_managed)
        .await?;
    let created = state
        .repos
        .configurations
        .create_version(
            configuration.id,
            &version.to_string(),
            is_draft,
            &operator.claims.username,
            &files,
        )
        .await?;

    // The creator manages what they created.
    state
        .repos
        .auth
        .grant_resource_permission(
            operator.claims.user_id,
            "User",
            ResourceKind::Configuration.as_str(),
            configuration.id,
            LEVEL_MANAGE,
        )
        .await?;

    tracing::info!(name = %name, version = %created.version, "configuration created");

    Ok((
        StatusCode::CREATED,
        Json(json!({"configuration": configuration, "version": created})),
    ))
}

/// `DELETE /configurations/{name}`: only when no version is assigned
pub async fn remove(
    State(state): State<AppState>,
    Path(name): Path<String>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    let configuration = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::Configuration,
        configuration.id,
        Level::Manage,
    )
    .await?;

    state.repos.configurations.delete(configuration.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /configurations/{name}/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    Path(name): Path<String>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    let configuration = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::Configuration,
        configuration.id,
        Level::Read,
    )
    .await?;

    let versions = state.repos.configurations.list_versions(configuration.id).await?;
    Ok(Json(json!({ "versions": versions })))
}

/// `POST /configurations/{name}/versions`
pub async fn create_version(
    State(state): State<AppState>,
    Path(name): Path<String>,
    operator: Operator,
    multipart: Multipart,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let configuration = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::Configuration,
        configuration.id,
        Level::Modify,
    )
    .await?;

    let payload = read_multipart(multipart).await?;
    let version = parse_version(require_field(&payload, "version")?)?;
    let is_draft = payload
        .fields
        .get("isDraft")
        .map(|v| v == "true")
        .unwrap_or(true);

    if !payload
        .files
        .iter()
        .any(|(path, _)| path == &configuration.entry_point)
    {
        return Err(ApiError(Error::Validation(format!(
            "entry point {} is not among the uploaded files",
            configuration.entry_point
        ))));
    }

    let files = store_files(&state, &payload.files).await?;
    let created = state
        .repos
        .configurations
        .create_version(
            configuration.id,
            &version.to_string(),
            is_draft,
            &operator.claims.username,
            &files,
        )
        .await?;

    tracing::info!(name = %name, version = %created.version, "configuration version uploaded");

    Ok((StatusCode::CREATED, Json(json!({ "version": created }))))
}

/// `PUT /configurations/{name}/versions/{version}/publish`
pub async fn publish(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    let configuration = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::Configuration,
        configuration.id,
        Level::Modify,
    )
    .await?;

    let published = state
        .repos
        .configurations
        .publish_version(configuration.id, &version)
        .await?;
    Ok(Json(json!({ "version": published })))
}

/// `PUT /configurations/{name}/versions/{version}/archive`
pub async fn archive(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    let configuration = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::Configuration,
        configuration.id,
        Level::Modify,
    )
    .await?;

    state
        .repos
        .configurations
        .archive_version(configuration.id, &version)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /configurations/{name}/versions/{version}`: blocked if in use
pub async fn delete_version(
    State(state): State<AppState>,
    Path((name, version)): Path<(String, String)>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    let configuration = lookup(&state, &name).await?;
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::Configuration,
        configuration.id,
        Level::Manage,
    )
    .await?;

    let row = state
        .repos
        .configurations
        .get_version(configuration.id, &version)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound(format!("version {}", version))))?;

    // In-use protection: the same computation retention relies on.
    let assignments = state.repos.nodes.list_assignments().await?;
    let mut versions = Vec::new();
    for config in state.repos.configurations.list().await? {
        versions.extend(state.repos.configurations.list_versions(config.id).await?);
    }
    let mut composite_versions = Vec::new();
    for composite in state.repos.composites.list().await? {
        composite_versions.extend(state.repos.composites.list_versions(composite.id).await?);
    }
    let composite_items = state.repos.composites.list_all_items().await?;
    let in_use = crate::services::retention::in_use_versions(
        &assignments,
        &versions,
        &composite_versions,
        &composite_items,
    );
    if in_use.contains(&row.id) {
        return Err(ApiError(Error::Conflict(format!(
            "version {} is in use and cannot be deleted",
            version
        ))));
    }

    state.repos.configurations.delete_version(row.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn lookup(state: &AppState, name: &str) -> Result<ConfigurationRow, ApiError> {
    state
        .repos
        .configurations
        .get_by_name(name)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound(format!("configuration {}", name))))
}
