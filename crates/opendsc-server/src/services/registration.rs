//! Node registration and credential lifecycle

use chrono::Utc;

use opendsc_core::wire::{RegisterRequest, RegisterResponse};
use opendsc_core::{Error, Result};

use crate::auth::certs::{self, ParsedCertificate};
use crate::auth::identity::NodeIdentity;
use crate::auth::tokens;
use crate::state::AppState;

/// Register a node: validate and consume the registration key, bind the
/// presented certificate's fingerprint, and issue the node id
pub async fn register(state: &AppState, request: &RegisterRequest) -> Result<RegisterResponse> {
    if request.fqdn.is_empty() || !request.fqdn.chars().all(valid_fqdn_char) {
        return Err(Error::Validation(format!("invalid FQDN {:?}", request.fqdn)));
    }

    let (key_id, secret) = tokens::parse(tokens::REGISTRATION_KEY_PREFIX, &request.registration_key)?;
    let key = state
        .repos
        .registration_keys
        .get(key_id)
        .await?
        .ok_or_else(|| Error::Unauthorized("unknown registration key".into()))?;

    if key.revoked {
        return Err(Error::Unauthorized("registration key revoked".into()));
    }
    if key.expires_at < Utc::now() {
        return Err(Error::Unauthorized("registration key expired".into()));
    }
    if let Some(max_uses) = key.max_uses {
        if key.use_count >= max_uses {
            return Err(Error::Unauthorized("registration key exhausted".into()));
        }
    }
    if !tokens::verify_secret(&key.token_hash, &secret) {
        return Err(Error::Unauthorized("invalid registration key".into()));
    }

    let certificate = certs::parse_certificate_pem(&request.certificate_pem)?;
    if certificate.not_after < Utc::now() {
        return Err(Error::Validation("certificate is already expired".into()));
    }

    // Consume first: the compare-and-increment is the authoritative guard
    // against concurrent registrations racing past max_uses.
    state.repos.registration_keys.consume(key_id).await?;

    let node = state
        .repos
        .nodes
        .insert(&request.fqdn, &certificate.fingerprint, certificate.not_after)
        .await?;

    tracing::info!(
        node_id = %node.id,
        fqdn = %node.fqdn,
        fingerprint = %certificate.fingerprint,
        "node registered"
    );

    Ok(RegisterResponse {
        node_id: node.id,
        fqdn: node.fqdn,
    })
}

/// Rotate a node's certificate
///
/// The request runs on the old certificate; the stored fingerprint is
/// swapped only on success, so the old certificate stays valid for the
/// duration of the request and becomes invalid on the next connection.
pub async fn rotate(
    state: &AppState,
    identity: &NodeIdentity,
    new_certificate_pem: &str,
) -> Result<ParsedCertificate> {
    let new_certificate = certs::parse_certificate_pem(new_certificate_pem)?;
    if new_certificate.not_after < Utc::now() {
        return Err(Error::Validation("replacement certificate is already expired".into()));
    }
    if new_certificate.fingerprint == identity.certificate.fingerprint {
        return Err(Error::Validation(
            "replacement certificate matches the current one".into(),
        ));
    }

    state
        .repos
        .nodes
        .rotate_fingerprint(
            identity.node.id,
            &identity.certificate.fingerprint,
            &new_certificate.fingerprint,
            new_certificate.not_after,
        )
        .await?;

    tracing::info!(
        node_id = %identity.node.id,
        new_fingerprint = %new_certificate.fingerprint,
        "node certificate rotated"
    );

    Ok(new_certificate)
}

fn valid_fqdn_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'
}
