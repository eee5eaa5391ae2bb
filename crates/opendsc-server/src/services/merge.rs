//! Parameter merge service
//!
//! Resolves a node's effective parameters for a configuration: collects the
//! active parameter file of every applicable scope in ascending precedence
//! (Default, tagged scopes, Node by FQDN), loads the bytes, and merges them
//! with provenance. The metadata snapshot comes from a single statement;
//! blob loads happen afterwards, with no lock held across file I/O.

use uuid::Uuid;

use opendsc_core::merge::{self, DocumentFormat, MergeOutcome, MergeSource};
use opendsc_core::{Error, Result};

use crate::state::AppState;

/// A node's merged parameters, ready for bundling
#[derive(Debug, Clone)]
pub struct MergedParameters {
    /// Canonical YAML rendering (UTF-8, no BOM)
    pub yaml: String,
    /// Merged value plus provenance index
    pub outcome: MergeOutcome,
}

/// Resolve the effective parameters of `(node, configuration)`
///
/// Returns `None` when server-managed parameters are disabled for the
/// assignment or when no scope has an active parameter file.
pub async fn effective_parameters(
    state: &AppState,
    configuration_id: Uuid,
    node_id: Uuid,
    fqdn: &str,
    use_server_managed: bool,
) -> Result<Option<MergedParameters>> {
    if !use_server_managed {
        return Ok(None);
    }

    let rows = state
        .repos
        .parameters
        .merge_sources(configuration_id, node_id, fqdn)
        .await?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut sources = Vec::with_capacity(rows.len());
    for row in rows {
        let source = MergeSource::new(
            row.scope_type_name.clone(),
            row.scope_value.clone(),
            row.precedence,
        );
        // A metadata row whose blob is gone must not break the bundle.
        let bytes = match state.content.get(&row.content_hash).await? {
            Some(bytes) => bytes,
            None => {
                tracing::warn!(
                    source = %source.tag(),
                    content_hash = %row.content_hash,
                    "parameter content missing from store, skipping source"
                );
                continue;
            }
        };
        let format = DocumentFormat::from_content_type(&row.content_type);
        let document = merge::parse_document(&source.tag(), &bytes, format)?;
        sources.push((source, document));
    }

    if sources.is_empty() {
        return Ok(None);
    }

    let outcome = merge::merge(&sources)?;
    let yaml = merge::to_yaml(&outcome.merged)?;
    Ok(Some(MergedParameters { yaml, outcome }))
}

/// Diagnostic merge for the provenance endpoint: Default plus one scope
pub async fn scoped_parameters(
    state: &AppState,
    configuration_id: Uuid,
    scope_type_id: Uuid,
    scope_value: Option<&str>,
) -> Result<MergeOutcome> {
    let scope_type = state
        .repos
        .scopes
        .get_type(scope_type_id)
        .await?
        .ok_or_else(|| Error::NotFound("scope type".into()))?;

    let mut sources = Vec::new();

    // Default always participates unless it is the scope under inspection.
    if scope_type.name != "Default" {
        let default_type = state
            .repos
            .scopes
            .get_type_by_name("Default")
            .await?
            .ok_or_else(|| Error::NotFound("Default scope type".into()))?;
        if let Some(row) = state
            .repos
            .parameters
            .active_for(configuration_id, default_type.id, None)
            .await?
        {
            push_source(state, &mut sources, "Default", None, default_type.precedence, &row.content_hash, &row.content_type)
                .await?;
        }
    }

    let scope_value_id = match scope_value {
        Some(value) => Some(
            state
                .repos
                .scopes
                .find_value(scope_type_id, value)
                .await?
                .ok_or_else(|| Error::NotFound(format!("scope value {}", value)))?
                .id,
        ),
        None => None,
    };

    if let Some(row) = state
        .repos
        .parameters
        .active_for(configuration_id, scope_type_id, scope_value_id)
        .await?
    {
        push_source(
            state,
            &mut sources,
            &scope_type.name,
            scope_value,
            scope_type.precedence,
            &row.content_hash,
            &row.content_type,
        )
        .await?;
    }

    merge::merge(&sources)
}

async fn push_source(
    state: &AppState,
    sources: &mut Vec<(MergeSource, serde_json::Value)>,
    scope_type: &str,
    scope_value: Option<&str>,
    precedence: i32,
    content_hash: &str,
    content_type: &str,
) -> Result<()> {
    let source = MergeSource::new(scope_type, scope_value.map(str::to_string), precedence);
    let bytes = match state.content.get(content_hash).await? {
        Some(bytes) => bytes,
        None => {
            tracing::warn!(source = %source.tag(), "parameter content missing from store");
            return Ok(());
        }
    };
    let document =
        merge::parse_document(&source.tag(), &bytes, DocumentFormat::from_content_type(content_type))?;
    sources.push((source, document));
    Ok(())
}
