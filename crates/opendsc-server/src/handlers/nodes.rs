//! Node-facing and node-administration endpoints

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use opendsc_core::wire::{
    ChecksumResponse, ComplianceReportRequest, RegisterRequest, RegisterResponse,
    RotateCertificateRequest,
};
use opendsc_core::Error;

use crate::auth::identity::{NodeIdentity, Operator};
use crate::auth::permissions::require_global;
use crate::auth::tokens;
use crate::error::{ApiError, ApiResult};
use crate::services::{bundle, registration};
use crate::state::AppState;

fn ensure_self(identity: &NodeIdentity, id: Uuid) -> Result<(), ApiError> {
    if identity.node.id == id {
        Ok(())
    } else {
        Err(ApiError(Error::Forbidden(
            "certificate does not belong to the addressed node".into(),
        )))
    }
}

/// `POST /nodes/register`
pub async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<RegisterResponse>)> {
    let response = registration::register(&state, &request).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// `POST /nodes/{id}/rotate-certificate`
pub async fn rotate_certificate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: NodeIdentity,
    Json(request): Json<RotateCertificateRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    ensure_self(&identity, id)?;
    let new_certificate = registration::rotate(&state, &identity, &request.certificate_pem).await?;
    Ok(Json(json!({
        "fingerprint": new_certificate.fingerprint,
        "notAfter": new_certificate.not_after,
    })))
}

/// `GET /nodes/{id}/configuration/checksum`
pub async fn configuration_checksum(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: NodeIdentity,
) -> ApiResult<Json<ChecksumResponse>> {
    ensure_self(&identity, id)?;

    let assignment = state
        .repos
        .nodes
        .assignment_for(id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("node has no assigned configuration".into())))?;

    let resolved =
        bundle::resolve_for_assignment(&state, &assignment, id, &identity.node.fqdn).await?;

    Ok(Json(ChecksumResponse {
        checksum: resolved.manifest_checksum(),
        configuration: resolved.name,
        version: resolved.version,
        entry_point: resolved.entry_point,
    }))
}

/// `GET /nodes/{id}/configuration`: the bundle stream
pub async fn configuration_bundle(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: NodeIdentity,
) -> ApiResult<Response> {
    ensure_self(&identity, id)?;

    let assignment = state
        .repos
        .nodes
        .assignment_for(id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("node has no assigned configuration".into())))?;

    let resolved =
        bundle::resolve_for_assignment(&state, &assignment, id, &identity.node.fqdn).await?;
    let manifest = resolved.manifest_checksum();
    let filename = format!("{}-{}.zip", resolved.name, resolved.version);

    let built = bundle::write_archive(resolved).await?;
    let stream = ReaderStream::new(tokio::fs::File::from_std(built.file));

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_LENGTH, built.size)
        .header(header::ETAG, format!("\"{}\"", built.archive_checksum))
        .header("x-manifest-checksum", manifest)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError(Error::TransientIo(format!("response: {}", e))))?;
    Ok(response)
}

/// `POST /nodes/{id}/reports`
pub async fn submit_report(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    identity: NodeIdentity,
    Json(report): Json<ComplianceReportRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    ensure_self(&identity, id)?;

    let raw = serde_json::to_value(&report.result).map_err(Error::from)?;
    let row = state
        .repos
        .reports
        .append(
            id,
            &report.operation.to_string(),
            report.exit_code,
            report.in_desired_state,
            report.started_at,
            report.ended_at,
            &raw,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({"id": row.id}))))
}

/// `GET /nodes/{id}/reports` (operator)
pub async fn list_reports(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_global(&operator.claims, "nodes.read")?;
    let reports = state.repos.reports.list_for_node(id, 100).await?;
    Ok(Json(json!({ "reports": reports })))
}

/// `GET /nodes`
pub async fn list(
    State(state): State<AppState>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_global(&operator.claims, "nodes.read")?;
    let nodes = state.repos.nodes.list().await?;
    Ok(Json(json!({ "nodes": nodes })))
}

/// `GET /nodes/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
) -> ApiResult<Json<serde_json::Value>> {
    require_global(&operator.claims, "nodes.read")?;
    let node = state
        .repos
        .nodes
        .get(id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("node".into())))?;
    let tags = state.repos.nodes.tags_for(id).await?;
    let assignment = state.repos.nodes.assignment_for(id).await?;
    Ok(Json(json!({"node": node, "tags": tags, "assignment": assignment})))
}

/// `DELETE /nodes/{id}`
pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "nodes.manage")?;
    state.repos.nodes.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct TagRequest {
    #[serde(rename = "scopeValueId")]
    pub scope_value_id: Uuid,
}

/// `POST /nodes/{id}/tags`: one value per scope type per node
pub async fn tag(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
    Json(request): Json<TagRequest>,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "nodes.manage")?;

    let value = state
        .repos
        .scopes
        .get_value(request.scope_value_id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("scope value".into())))?;

    state.repos.nodes.tag(id, value.scope_type_id, value.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /nodes/{id}/tags/{scope_type_id}`
pub async fn untag(
    State(state): State<AppState>,
    Path((id, scope_type_id)): Path<(Uuid, Uuid)>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "nodes.manage")?;
    state.repos.nodes.untag(id, scope_type_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    /// Configuration name; exactly one of this and `composite`
    pub configuration: Option<String>,
    /// Composite configuration name
    pub composite: Option<String>,
    #[serde(rename = "pinnedVersion")]
    pub pinned_version: Option<String>,
    #[serde(rename = "useServerManagedParameters", default = "default_true")]
    pub use_server_managed_parameters: bool,
}

fn default_true() -> bool {
    true
}

/// `PUT /nodes/{id}/configuration`: assign or replace the node's target
pub async fn assign(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
    Json(request): Json<AssignRequest>,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "nodes.manage")?;

    state
        .repos
        .nodes
        .get(id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("node".into())))?;

    let (configuration_id, composite_id) = match (&request.configuration, &request.composite) {
        (Some(name), None) => {
            let configuration = state
                .repos
                .configurations
                .get_by_name(name)
                .await?
                .ok_or_else(|| ApiError(Error::NotFound(format!("configuration {}", name))))?;
            (Some(configuration.id), None)
        }
        (None, Some(name)) => {
            let composite = state
                .repos
                .composites
                .get_by_name(name)
                .await?
                .ok_or_else(|| ApiError(Error::NotFound(format!("composite {}", name))))?;
            (None, Some(composite.id))
        }
        _ => {
            return Err(ApiError(Error::Validation(
                "exactly one of configuration or composite is required".into(),
            )))
        }
    };

    state
        .repos
        .nodes
        .assign(
            id,
            configuration_id,
            composite_id,
            request.pinned_version.as_deref(),
            request.use_server_managed_parameters,
        )
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct IssueKeyRequest {
    /// Days until the key expires
    #[serde(rename = "expiresInDays", default = "default_key_expiry")]
    pub expires_in_days: i64,
    /// Maximum registrations; absent means unlimited until expiry
    #[serde(rename = "maxUses")]
    pub max_uses: Option<i32>,
}

fn default_key_expiry() -> i64 {
    30
}

/// `POST /registration-keys`
pub async fn issue_registration_key(
    State(state): State<AppState>,
    operator: Operator,
    Json(request): Json<IssueKeyRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_global(&operator.claims, "registration-keys.manage")?;

    let issued = tokens::issue(tokens::REGISTRATION_KEY_PREFIX)?;
    let key = state
        .repos
        .registration_keys
        .issue(
            issued.id,
            &issued.secret_hash,
            &operator.claims.username,
            Utc::now() + Duration::days(request.expires_in_days),
            request.max_uses,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": key.id,
            "key": issued.token,
            "expiresAt": key.expires_at,
            "maxUses": key.max_uses,
        })),
    ))
}

/// `DELETE /registration-keys/{id}`
pub async fn revoke_registration_key(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    require_global(&operator.claims, "registration-keys.manage")?;
    state.repos.registration_keys.revoke(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
