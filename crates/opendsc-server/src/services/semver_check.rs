//! SemVer compliance check for parameter uploads
//!
//! Compares the schema of a new parameter version against the most recent
//! published version of the same scope and demands a bump matching the
//! structural change: removal or type change requires MAJOR, additions at
//! least MINOR, identical shapes at least PATCH. Violations only block when
//! the server's enforce-semver setting is on.

use uuid::Uuid;

use opendsc_core::schema::{diff_class, SchemaDiff};
use opendsc_core::version::Version;
use opendsc_core::{Error, Result};

use crate::state::AppState;

/// Outcome of the compliance check
#[derive(Debug, Clone)]
pub enum ComplianceOutcome {
    /// First version of this scope, or bump matches the change
    Ok(SchemaDiff),
    /// Bump too small; message describes the demanded bump
    Violation(String),
}

/// Check a new parameter version against its predecessor
pub async fn check_parameter_upload(
    state: &AppState,
    configuration_id: Uuid,
    scope_type_id: Uuid,
    scope_value_id: Option<Uuid>,
    new_version: &Version,
    new_schema: &serde_json::Value,
) -> Result<ComplianceOutcome> {
    let existing = state
        .repos
        .parameters
        .list_versions(configuration_id, scope_type_id, scope_value_id)
        .await?;

    // Compare against the highest published predecessor.
    let previous = existing
        .iter()
        .filter(|row| !row.is_draft && !row.is_archived)
        .filter_map(|row| {
            row.version
                .parse::<Version>()
                .ok()
                .map(|version| (version, row))
        })
        .max_by(|(a, _), (b, _)| a.cmp(b));

    let Some((previous_version, previous_row)) = previous else {
        return Ok(ComplianceOutcome::Ok(SchemaDiff::Identical));
    };

    let previous_schema = state
        .repos
        .parameters
        .get_schema(&previous_row.schema_hash)
        .await?
        .ok_or_else(|| {
            Error::Integrity(format!(
                "schema {} referenced but missing",
                previous_row.schema_hash
            ))
        })?;

    let diff = diff_class(&previous_schema.schema, new_schema);

    if new_version.satisfies_bump(&previous_version, diff) {
        return Ok(ComplianceOutcome::Ok(diff));
    }

    let demanded = match diff {
        SchemaDiff::Breaking => "a MAJOR bump",
        SchemaDiff::Additive => "at least a MINOR bump",
        SchemaDiff::Identical => "a version increase",
    };
    let message = format!(
        "schema change from {} to {} is {:?} and demands {}",
        previous_version, new_version, diff, demanded
    );

    if state.config.versioning.enforce_semver {
        return Err(Error::SemVerViolation(message));
    }
    tracing::warn!(%message, "semver compliance violation (not enforced)");
    Ok(ComplianceOutcome::Violation(message))
}
