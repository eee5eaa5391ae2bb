//! Operator session and token endpoints

use axum::extract::State;
use axum::http::header::SET_COOKIE;
use axum::http::StatusCode;
use axum::response::{AppendHeaders, IntoResponse};
use axum::Json;
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::json;

use opendsc_core::Error;

use crate::auth::identity::{Operator, SESSION_COOKIE};
use crate::auth::tokens;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Issue a session cookie for valid credentials
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = state
        .repos
        .auth
        .get_user_by_username(&request.username)
        .await?
        .ok_or_else(|| ApiError(Error::Unauthorized("invalid credentials".into())))?;

    if !user.is_enabled || !tokens::verify_secret(&user.password_hash, &request.password) {
        return Err(ApiError(Error::Unauthorized("invalid credentials".into())));
    }

    let session = state.repos.auth.create_session(user.id).await?;
    let max_age = state.config.security.session_absolute_hours * 3600;
    let cookie = format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        SESSION_COOKIE,
        session.id,
        max_age
    );

    tracing::info!(username = %user.username, "operator logged in");

    Ok((
        AppendHeaders([(SET_COOKIE, cookie)]),
        Json(json!({"userId": user.id, "username": user.username})),
    ))
}

/// Invalidate the current session cookie
pub async fn logout(State(_state): State<AppState>, _operator: Operator) -> impl IntoResponse {
    let cookie = format!("{}=deleted; HttpOnly; Path=/; Max-Age=0", SESSION_COOKIE);
    (StatusCode::NO_CONTENT, AppendHeaders([(SET_COOKIE, cookie)]))
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub label: String,
    /// Days until expiry; absent means no expiry
    #[serde(rename = "expiresInDays")]
    pub expires_in_days: Option<i64>,
}

/// Issue a personal access token for the current operator
pub async fn create_token(
    State(state): State<AppState>,
    operator: Operator,
    Json(request): Json<CreateTokenRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let issued = tokens::issue(tokens::PAT_PREFIX)?;
    let expires_at = request
        .expires_in_days
        .map(|days| Utc::now() + Duration::days(days));

    // The caller sees the full token exactly once.
    let pat = state
        .repos
        .auth
        .create_pat(
            issued.id,
            operator.claims.user_id,
            &issued.secret_hash,
            &request.label,
            expires_at,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": pat.id,
            "token": issued.token,
            "label": pat.label,
            "expiresAt": pat.expires_at,
        })),
    ))
}

/// Revoke one of the current operator's tokens
pub async fn revoke_token(
    State(state): State<AppState>,
    axum::extract::Path(id): axum::extract::Path<uuid::Uuid>,
    operator: Operator,
) -> ApiResult<StatusCode> {
    let pat = state
        .repos
        .auth
        .get_pat(id)
        .await?
        .ok_or_else(|| ApiError(Error::NotFound("token".into())))?;
    if pat.user_id != operator.claims.user_id {
        return Err(ApiError(Error::Forbidden("token belongs to another user".into())));
    }
    state.repos.auth.revoke_pat(id).await?;
    Ok(StatusCode::NO_CONTENT)
}
