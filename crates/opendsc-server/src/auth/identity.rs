//! Request identity extractors

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use uuid::Uuid;

use opendsc_core::Error;
use opendsc_storage::postgres::nodes::NodeRow;

use crate::auth::certs::{self, ParsedCertificate};
use crate::auth::tokens;
use crate::error::ApiError;
use crate::state::{AppState, UserClaims};

/// Cookie carrying the operator session id
pub const SESSION_COOKIE: &str = "opendsc_session";

/// An authenticated operator (session cookie or `pat_` bearer token)
#[derive(Debug, Clone)]
pub struct Operator {
    pub claims: Arc<UserClaims>,
}

/// An authenticated node (mTLS client certificate)
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node: NodeRow,
    /// The certificate the request was made with
    pub certificate: ParsedCertificate,
}

impl Operator {
    async fn from_session(state: &AppState, session_id: Uuid) -> Result<Self, Error> {
        let session = state
            .repos
            .auth
            .get_session(session_id)
            .await?
            .ok_or_else(|| Error::Unauthorized("unknown session".into()))?;

        let now = Utc::now();
        let idle_limit = Duration::minutes(state.config.security.session_idle_minutes);
        let absolute_limit = Duration::hours(state.config.security.session_absolute_hours);
        if now - session.last_seen_at > idle_limit || now - session.created_at > absolute_limit {
            state.repos.auth.delete_session(session_id).await.ok();
            return Err(Error::Unauthorized("session expired".into()));
        }
        state.repos.auth.touch_session(session_id).await?;

        let claims = load_claims(state, session.user_id).await?;
        Ok(Self { claims })
    }

    async fn from_pat(state: &AppState, token: &str) -> Result<Self, Error> {
        let (id, secret) = tokens::parse(tokens::PAT_PREFIX, token)?;
        let pat = state
            .repos
            .auth
            .get_pat(id)
            .await?
            .ok_or_else(|| Error::Unauthorized("unknown token".into()))?;

        if pat.revoked {
            return Err(Error::Unauthorized("token revoked".into()));
        }
        if let Some(expires_at) = pat.expires_at {
            if expires_at < Utc::now() {
                return Err(Error::Unauthorized("token expired".into()));
            }
        }
        if !tokens::verify_secret(&pat.token_hash, &secret) {
            return Err(Error::Unauthorized("invalid token".into()));
        }

        let claims = load_claims(state, pat.user_id).await?;
        Ok(Self { claims })
    }
}

/// Load (or rebuild) the cached claims for a user
async fn load_claims(state: &AppState, user_id: Uuid) -> Result<Arc<UserClaims>, Error> {
    if let Some(claims) = state.claims.get(&user_id).await {
        return Ok(claims);
    }

    let user = state
        .repos
        .auth
        .get_user(user_id)
        .await?
        .ok_or_else(|| Error::Unauthorized("unknown user".into()))?;
    if !user.is_enabled {
        return Err(Error::Unauthorized("user disabled".into()));
    }

    let permissions: HashSet<String> = state
        .repos
        .auth
        .permissions_for_user(user_id)
        .await?
        .into_iter()
        .collect();
    let groups = state.repos.auth.groups_for_user(user_id).await?;

    let claims = Arc::new(UserClaims {
        user_id,
        username: user.username,
        permissions,
        groups,
    });
    state.claims.insert(user_id, claims.clone()).await;
    Ok(claims)
}

fn session_id_from_cookies(parts: &Parts) -> Option<Uuid> {
    let header = parts.headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in header.split(';') {
        let mut kv = pair.trim().splitn(2, '=');
        if kv.next() == Some(SESSION_COOKIE) {
            return kv.next().and_then(|v| Uuid::parse_str(v).ok());
        }
    }
    None
}

fn bearer_token(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Operator {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        if let Some(token) = bearer_token(parts) {
            return Operator::from_pat(state, &token).await.map_err(ApiError);
        }
        if let Some(session_id) = session_id_from_cookies(parts) {
            return Operator::from_session(state, session_id).await.map_err(ApiError);
        }
        Err(ApiError(Error::Unauthorized(
            "session cookie or bearer token required".into(),
        )))
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for NodeIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let header_name = &state.config.security.client_cert_header;
        let raw = parts
            .headers
            .get(header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError(Error::Unauthorized("client certificate required".into())))?;

        let pem = certs::decode_cert_header(raw).map_err(ApiError)?;
        let certificate = certs::parse_certificate_pem(&pem).map_err(ApiError)?;

        let node = state
            .repos
            .nodes
            .find_by_fingerprint(&certificate.fingerprint)
            .await
            .map_err(ApiError)?
            .ok_or_else(|| ApiError(Error::Unauthorized("unknown client certificate".into())))?;

        state.repos.nodes.touch_last_seen(node.id).await.ok();

        Ok(NodeIdentity { node, certificate })
    }
}
