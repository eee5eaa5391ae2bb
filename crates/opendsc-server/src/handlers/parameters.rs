//! Parameter distribution endpoints

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use opendsc_core::merge::{parse_document, DocumentFormat};
use opendsc_core::naming::validate_name;
use opendsc_core::schema::{derive_schema, schema_hash};
use opendsc_core::version::Version;
use opendsc_core::Error;
use opendsc_storage::postgres::scopes::ScopeTypeRow;

use crate::auth::identity::Operator;
use crate::auth::permissions::{require_resource, Level, ResourceKind};
use crate::error::{ApiError, ApiResult};
use crate::services::semver_check::{self, ComplianceOutcome};
use crate::services::merge as merge_service;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UploadQuery {
    pub version: String,
    #[serde(rename = "scopeValue")]
    pub scope_value: Option<String>,
    #[serde(rename = "isDraft")]
    pub is_draft: Option<bool>,
}

/// Resolve the scope value id for an upload or activation
///
/// Default takes no value; Node values are created implicitly from FQDNs;
/// other value-bearing types require an existing value.
async fn resolve_scope_value(
    state: &AppState,
    scope_type: &ScopeTypeRow,
    scope_value: Option<&str>,
) -> Result<Option<Uuid>, ApiError> {
    match (scope_type.name.as_str(), scope_value) {
        (_, None) if !scope_type.allows_values => Ok(None),
        (name, Some(_)) if !scope_type.allows_values => Err(ApiError(Error::Validation(
            format!("the {} scope takes no value", name),
        ))),
        ("Node", Some(fqdn)) => {
            validate_name(fqdn)?;
            if let Some(existing) = state.repos.scopes.find_value(scope_type.id, fqdn).await? {
                return Ok(Some(existing.id));
            }
            let created = state.repos.scopes.add_value(scope_type.id, fqdn).await?;
            Ok(Some(created.id))
        }
        (_, Some(value)) => {
            let row = state
                .repos
                .scopes
                .find_value(scope_type.id, value)
                .await?
                .ok_or_else(|| ApiError(Error::NotFound(format!("scope value {}", value))))?;
            Ok(Some(row.id))
        }
        (_, None) => Err(ApiError(Error::Validation(format!(
            "scope type {} requires a scopeValue",
            scope_type.name
        )))),
    }
}

async fn load_scope_type(state: &AppState, id: Uuid) -> Result<ScopeTypeRow, ApiError> {
    state
        .repos
        .scopes
        .get_type(id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("scope type".into())))
}

/// `POST /parameters/{scope_type_id}/{config_id}`: upload a parameter
/// version (draft by default)
pub async fn upload(
    State(state): State<AppState>,
    Path((scope_type_id, config_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<UploadQuery>,
    operator: Operator,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    // Parameter modify is its own ACL, independent from configuration read.
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::ParameterFile,
        config_id,
        Level::Modify,
    )
    .await?;

    let configuration = state
        .repos
        .configurations
        .get(config_id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("configuration".into())))?;
    if !configuration.is_server_managed {
        return Err(ApiError(Error::Conflict(format!(
            "configuration {} does not use server-managed parameters",
            configuration.name
        ))));
    }

    let scope_type = load_scope_type(&state, scope_type_id).await?;
    let scope_value_id =
        resolve_scope_value(&state, &scope_type, query.scope_value.as_deref()).await?;
    let version = query.version.parse::<Version>().map_err(ApiError)?;

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/yaml")
        .to_string();
    let format = DocumentFormat::from_content_type(&content_type);

    // Parse up front so a bad document never lands in the store.
    let tag = match &query.scope_value {
        Some(value) => format!("{}:{}", scope_type.name, value),
        None => scope_type.name.clone(),
    };
    let document = parse_document(&tag, &body, format)?;
    if !document.is_object() {
        return Err(ApiError(Error::Validation(
            "parameter document must be a mapping".into(),
        )));
    }

    let schema = derive_schema(&document);
    let hash = schema_hash(&schema);

    let compliance = semver_check::check_parameter_upload(
        &state,
        config_id,
        scope_type_id,
        scope_value_id,
        &version,
        &schema,
    )
    .await?;

    state.repos.parameters.upsert_schema(&hash, &schema).await?;
    let content_hash = state.content.put(&body).await?;

    let row = state
        .repos
        .parameters
        .insert(
            config_id,
            scope_type_id,
            scope_value_id,
            &version.to_string(),
            &content_hash,
            &content_type,
            &hash,
            query.is_draft.unwrap_or(true),
            &operator.claims.username,
        )
        .await?;

    let warning = match compliance {
        ComplianceOutcome::Ok(_) => None,
        ComplianceOutcome::Violation(message) => Some(message),
    };

    tracing::info!(
        configuration = %configuration.name,
        scope = %tag,
        version = %row.version,
        schema_hash = %hash,
        "parameter version uploaded"
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({"parameter": row, "semverWarning": warning})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ScopeValueQuery {
    #[serde(rename = "scopeValue")]
    pub scope_value: Option<String>,
}

/// `PUT /parameters/{scope_type_id}/{config_id}/versions/{version}/activate`
pub async fn activate(
    State(state): State<AppState>,
    Path((scope_type_id, config_id, version)): Path<(Uuid, Uuid, String)>,
    Query(query): Query<ScopeValueQuery>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::ParameterFile,
        config_id,
        Level::Modify,
    )
    .await?;

    let scope_type = load_scope_type(&state, scope_type_id).await?;
    let scope_value_id =
        resolve_scope_value(&state, &scope_type, query.scope_value.as_deref()).await?;

    let activated = state
        .repos
        .parameters
        .activate(config_id, scope_type_id, scope_value_id, &version)
        .await?;

    tracing::info!(
        configuration_id = %config_id,
        scope_type = %scope_type.name,
        version = %version,
        "parameter version activated"
    );

    Ok(Json(json!({ "parameter": activated })))
}

/// `GET /parameters/{scope_type_id}/{config_id}/versions`
pub async fn list_versions(
    State(state): State<AppState>,
    Path((scope_type_id, config_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<ScopeValueQuery>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::ParameterFile,
        config_id,
        Level::Read,
    )
    .await?;

    let scope_type = load_scope_type(&state, scope_type_id).await?;
    let scope_value_id =
        resolve_scope_value(&state, &scope_type, query.scope_value.as_deref()).await?;

    let versions = state
        .repos
        .parameters
        .list_versions(config_id, scope_type_id, scope_value_id)
        .await?;
    Ok(Json(json!({ "versions": versions })))
}

/// `GET /parameters/{scope_type_id}/{config_id}/provenance`: diagnostic
/// merge of the Default scope with the addressed scope
pub async fn provenance(
    State(state): State<AppState>,
    Path((scope_type_id, config_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<ScopeValueQuery>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_resource(
        &state,
        &operator.claims,
        ResourceKind::ParameterFile,
        config_id,
        Level::Read,
    )
    .await?;

    let outcome = merge_service::scoped_parameters(
        &state,
        config_id,
        scope_type_id,
        query.scope_value.as_deref(),
    )
    .await?;

    Ok(Json(json!({
        "merged": outcome.merged,
        "provenance": outcome.provenance,
    })))
}
