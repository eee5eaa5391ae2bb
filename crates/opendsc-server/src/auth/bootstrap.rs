//! First-run administrator bootstrap
//!
//! An empty user table gets one administrator with the wildcard role so the
//! server is operable after installation. The password comes from the
//! environment; without it the server starts but only node endpoints work.

use opendsc_storage::Repositories;

use opendsc_core::Result;

use crate::auth::tokens;

const ADMIN_USERNAME: &str = "admin";
const ADMIN_ROLE: &str = "administrators";
const PASSWORD_VAR: &str = "OPENDSC_ADMIN_PASSWORD";

/// Create the initial administrator when no users exist yet
pub async fn bootstrap_admin(repos: &Repositories) -> Result<()> {
    if repos.auth.count_users().await? > 0 {
        return Ok(());
    }

    let Ok(password) = std::env::var(PASSWORD_VAR) else {
        tracing::warn!(
            "no users exist and {} is not set; operator endpoints are unusable",
            PASSWORD_VAR
        );
        return Ok(());
    };

    let password_hash = tokens::hash_secret(&password)?;
    let user = repos
        .auth
        .create_user(ADMIN_USERNAME, "Administrator", &password_hash)
        .await?;
    let role = repos.auth.create_role(ADMIN_ROLE).await?;
    repos.auth.grant_role_permission(role, "*").await?;
    repos.auth.assign_role(user.id, role).await?;

    tracing::info!(username = ADMIN_USERNAME, "initial administrator created");
    Ok(())
}
