//! Opaque token issue and verification
//!
//! Personal access tokens and registration keys share one shape:
//! `<prefix>_<id>_<secret>` where `id` is the row's UUID in simple form and
//! `secret` is random. Only the argon2 hash of the secret is stored.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use opendsc_core::{Error, Result};

/// Prefix for personal access tokens
pub const PAT_PREFIX: &str = "pat";
/// Prefix for registration keys
pub const REGISTRATION_KEY_PREFIX: &str = "rk";

/// A freshly generated token; the full string is shown to the caller once
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// Row id embedded in the token
    pub id: Uuid,
    /// The complete token string
    pub token: String,
    /// Argon2 hash of the secret, for storage
    pub secret_hash: String,
}

/// Generate a token with the given prefix
pub fn issue(prefix: &str) -> Result<IssuedToken> {
    let id = Uuid::new_v4();
    let secret: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    let token = format!("{}_{}_{}", prefix, id.simple(), secret);
    let secret_hash = hash_secret(&secret)?;
    Ok(IssuedToken { id, token, secret_hash })
}

/// Split a presented token into its row id and secret
pub fn parse(prefix: &str, token: &str) -> Result<(Uuid, String)> {
    let mut parts = token.splitn(3, '_');
    let (found_prefix, id, secret) = match (parts.next(), parts.next(), parts.next()) {
        (Some(p), Some(id), Some(secret)) => (p, id, secret),
        _ => return Err(Error::Unauthorized("malformed token".into())),
    };
    if found_prefix != prefix {
        return Err(Error::Unauthorized("unexpected token prefix".into()));
    }
    let id = Uuid::parse_str(id).map_err(|_| Error::Unauthorized("malformed token id".into()))?;
    Ok((id, secret.to_string()))
}

/// Hash a secret for storage
pub fn hash_secret(secret: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Validation(format!("cannot hash secret: {}", e)))
}

/// Verify a presented secret against a stored hash
pub fn verify_secret(stored_hash: &str, secret: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_parse_roundtrip() {
        let issued = issue(PAT_PREFIX).unwrap();
        assert!(issued.token.starts_with("pat_"));

        let (id, secret) = parse(PAT_PREFIX, &issued.token).unwrap();
        assert_eq!(id, issued.id);
        assert!(verify_secret(&issued.secret_hash, &secret));
    }

    #[test]
    fn test_wrong_secret_fails() {
        let issued = issue(REGISTRATION_KEY_PREFIX).unwrap();
        assert!(!verify_secret(&issued.secret_hash, "not-the-secret"));
    }

    #[test]
    fn test_parse_rejects_wrong_prefix() {
        let issued = issue(PAT_PREFIX).unwrap();
        assert!(parse(REGISTRATION_KEY_PREFIX, &issued.token).is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for raw in ["", "pat_", "pat_notauuid_s", "pat_only-two"] {
            assert!(parse(PAT_PREFIX, raw).is_err(), "{raw} accepted");
        }
    }
}
