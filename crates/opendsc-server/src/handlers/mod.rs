//! REST surface
//!
//! All routes live under `/api/v1`. Operator routes authenticate with a
//! session cookie or a `pat_` bearer token; node routes authenticate with
//! the mTLS client certificate.

pub mod composites;
pub mod configurations;
pub mod nodes;
pub mod parameters;
pub mod retention;
pub mod scopes;
pub mod session;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Assemble the full router
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // Operator session lifecycle
        .route("/auth/login", post(session::login))
        .route("/auth/logout", post(session::logout))
        .route("/auth/tokens", post(session::create_token))
        .route("/auth/tokens/:id", delete(session::revoke_token))
        // Node lifecycle
        .route("/nodes/register", post(nodes::register))
        .route("/nodes", get(nodes::list))
        .route("/nodes/:id", get(nodes::get).delete(nodes::remove))
        .route("/nodes/:id/rotate-certificate", post(nodes::rotate_certificate))
        .route("/nodes/:id/configuration/checksum", get(nodes::configuration_checksum))
        .route("/nodes/:id/configuration", get(nodes::configuration_bundle).put(nodes::assign))
        .route("/nodes/:id/reports", post(nodes::submit_report).get(nodes::list_reports))
        .route("/nodes/:id/tags", post(nodes::tag))
        .route("/nodes/:id/tags/:scope_type_id", delete(nodes::untag))
        .route("/registration-keys", post(nodes::issue_registration_key))
        .route("/registration-keys/:id", delete(nodes::revoke_registration_key))
        // Configurations
        .route("/configurations", get(configurations::list).post(configurations::create))
        .route("/configurations/:name", delete(configurations::remove))
        .route(
            "/configurations/:name/versions",
            get(configurations::list_versions).post(configurations::create_version),
        )
        .route(
            "/configurations/:name/versions/:version/publish",
            put(configurations::publish),
        )
        .route(
            "/configurations/:name/versions/:version/archive",
            put(configurations::archive),
        )
        .route(
            "/configurations/:name/versions/:version",
            delete(configurations::delete_version),
        )
        // Composite configurations
        .route(
            "/composite-configurations",
            get(composites::list).post(composites::create),
        )
        .route("/composite-configurations/:name", delete(composites::remove))
        .route(
            "/composite-configurations/:name/versions",
            get(composites::list_versions).post(composites::create_version),
        )
        .route(
            "/composite-configurations/:name/versions/:version/publish",
            put(composites::publish),
        )
        .route(
            "/composite-configurations/:name/versions/:version/items",
            get(composites::list_items),
        )
        // Scope metadata
        .route("/scope-types", get(scopes::list).post(scopes::create))
        .route("/scope-types/reorder", put(scopes::reorder))
        .route("/scope-types/:id", delete(scopes::remove))
        .route(
            "/scope-types/:id/values",
            get(scopes::list_values).post(scopes::add_value),
        )
        .route("/scope-types/:id/values/:value_id", delete(scopes::remove_value))
        // Parameters
        .route(
            "/parameters/:scope_type_id/:config_id",
            post(parameters::upload),
        )
        .route(
            "/parameters/:scope_type_id/:config_id/versions",
            get(parameters::list_versions),
        )
        .route(
            "/parameters/:scope_type_id/:config_id/versions/:version/activate",
            put(parameters::activate),
        )
        .route(
            "/parameters/:scope_type_id/:config_id/provenance",
            get(parameters::provenance),
        )
        // Retention
        .route(
            "/retention/configurations/cleanup",
            post(retention::configurations_cleanup),
        )
        .route("/retention/parameters/cleanup", post(retention::parameters_cleanup));

    Router::new()
        .nest("/api/v1", api)
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(state.config.server.max_request_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let database = match sqlx::query("SELECT 1").fetch_one(state.repos.pool()).await {
        Ok(_) => "up",
        Err(_) => "down",
    };
    let status = if database == "up" { "healthy" } else { "degraded" };
    Json(json!({
        "status": status,
        "components": { "database": { "status": database } }
    }))
}
