//! Retention planner
//!
//! Produces a deletion plan for configuration versions honoring, in order:
//! in-use protection (direct assignments and composite children, pinned or
//! resolved-latest), keep-N most recent, and keep-days. Planning is pure;
//! execution deletes per version in its own transaction so partial progress
//! is durable. Parameter retention is accepted but is a documented no-op
//! until its policy is defined.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use opendsc_core::version::{latest, Version, VersionCandidate};
use opendsc_core::{Error, Result};
use opendsc_storage::postgres::composites::{CompositeItemRow, CompositeVersionRow};
use opendsc_storage::postgres::configurations::VersionRow;
use opendsc_storage::postgres::nodes::AssignmentRow;

use crate::state::AppState;

/// Retention policy input
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Keep at least this many most-recently-created versions per
    /// configuration; must be >= 1
    pub keep_versions: usize,
    /// Keep versions created within this many days
    pub keep_days: u32,
    /// Plan only; delete nothing
    pub dry_run: bool,
}

impl RetentionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.keep_versions < 1 {
            return Err(Error::Validation("keep_versions must be at least 1".into()));
        }
        Ok(())
    }
}

/// Why a version was kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepReason {
    InUse,
    RecentCount,
    RecentAge,
}

/// One planned deletion
#[derive(Debug, Clone, Serialize)]
pub struct PlannedDeletion {
    pub version_id: Uuid,
    pub configuration_id: Uuid,
    pub version: String,
}

/// The full plan
#[derive(Debug, Clone, Serialize, Default)]
pub struct RetentionPlan {
    pub delete: Vec<PlannedDeletion>,
    pub kept: Vec<(Uuid, KeepReason)>,
}

/// Outcome of a retention run
#[derive(Debug, Clone, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub deleted: Vec<PlannedDeletion>,
    pub freed_bytes: u64,
}

/// Compute the set of configuration version ids currently in use
///
/// A version is in use when a node assignment pins it, when a null-pinned
/// assignment resolves to it as the latest published version, or when a
/// composite referenced by an assignment reaches it through a child item
/// (again pinned or resolved-latest).
pub fn in_use_versions(
    assignments: &[AssignmentRow],
    versions: &[VersionRow],
    composite_versions: &[CompositeVersionRow],
    composite_items: &[CompositeItemRow],
) -> HashSet<Uuid> {
    let mut by_config: HashMap<Uuid, Vec<&VersionRow>> = HashMap::new();
    for row in versions {
        by_config.entry(row.configuration_id).or_default().push(row);
    }
    let mut composite_by_id: HashMap<Uuid, Vec<&CompositeVersionRow>> = HashMap::new();
    for row in composite_versions {
        composite_by_id.entry(row.composite_id).or_default().push(row);
    }
    let mut items_by_composite_version: HashMap<Uuid, Vec<&CompositeItemRow>> = HashMap::new();
    for item in composite_items {
        items_by_composite_version
            .entry(item.composite_version_id)
            .or_default()
            .push(item);
    }

    let resolve_config = |configuration_id: Uuid, pinned: Option<&str>| -> Option<Uuid> {
        let rows = by_config.get(&configuration_id)?;
        match pinned {
            Some(pinned) => rows.iter().find(|r| r.version == pinned).map(|r| r.id),
            None => latest_of(rows.iter().map(|r| (&r.version, r.is_draft, r.is_archived)))
                .and_then(|winner| rows.iter().find(|r| r.version == winner).map(|r| r.id)),
        }
    };

    let mut in_use = HashSet::new();

    for assignment in assignments {
        if let Some(configuration_id) = assignment.configuration_id {
            if let Some(id) = resolve_config(configuration_id, assignment.pinned_version.as_deref()) {
                in_use.insert(id);
            }
        }
        if let Some(composite_id) = assignment.composite_id {
            let Some(rows) = composite_by_id.get(&composite_id) else {
                continue;
            };
            let resolved = match assignment.pinned_version.as_deref() {
                Some(pinned) => rows.iter().find(|r| r.version == pinned).map(|r| r.id),
                None => latest_of(rows.iter().map(|r| (&r.version, r.is_draft, r.is_archived)))
                    .and_then(|winner| rows.iter().find(|r| r.version == winner).map(|r| r.id)),
            };
            let Some(composite_version_id) = resolved else {
                continue;
            };
            for item in items_by_composite_version
                .get(&composite_version_id)
                .into_iter()
                .flatten()
            {
                if let Some(id) =
                    resolve_config(item.child_configuration_id, item.pinned_version.as_deref())
                {
                    in_use.insert(id);
                }
            }
        }
    }

    in_use
}

fn latest_of<'a>(rows: impl Iterator<Item = (&'a String, bool, bool)>) -> Option<String> {
    let candidates: Vec<VersionCandidate> = rows
        .filter_map(|(version, is_draft, is_archived)| {
            version.parse::<Version>().ok().map(|version| VersionCandidate {
                version,
                is_draft,
                is_archived,
            })
        })
        .collect();
    latest(&candidates, false).ok().map(|v| v.to_string())
}

/// Build the deletion plan
///
/// Protection rules apply in order; the first match keeps a version.
pub fn plan(
    versions: &[VersionRow],
    in_use: &HashSet<Uuid>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let age_floor = now - Duration::days(policy.keep_days as i64);

    let mut by_config: HashMap<Uuid, Vec<&VersionRow>> = HashMap::new();
    for row in versions {
        by_config.entry(row.configuration_id).or_default().push(row);
    }

    let mut result = RetentionPlan::default();

    for rows in by_config.values_mut() {
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        for (index, row) in rows.iter().enumerate() {
            if in_use.contains(&row.id) {
                result.kept.push((row.id, KeepReason::InUse));
            } else if index < policy.keep_versions {
                result.kept.push((row.id, KeepReason::RecentCount));
            } else if policy.keep_days > 0 && row.created_at >= age_floor {
                result.kept.push((row.id, KeepReason::RecentAge));
            } else {
                result.delete.push(PlannedDeletion {
                    version_id: row.id,
                    configuration_id: row.configuration_id,
                    version: row.version.clone(),
                });
            }
        }
    }

    // Deterministic output regardless of hash-map iteration order.
    result.delete.sort_by_key(|d| d.version_id);
    result.kept.sort_by_key(|(id, _)| *id);
    result
}

/// Run configuration retention: plan, then (unless dry-run) delete each
/// candidate version and any blobs no remaining file row references
pub async fn run_configuration_retention(
    state: &AppState,
    policy: RetentionPolicy,
) -> Result<RetentionReport> {
    policy.validate()?;

    let assignments = state.repos.nodes.list_assignments().await?;
    let mut versions = Vec::new();
    for configuration in state.repos.configurations.list().await? {
        versions.extend(state.repos.configurations.list_versions(configuration.id).await?);
    }
    let mut composite_versions = Vec::new();
    for composite in state.repos.composites.list().await? {
        composite_versions.extend(state.repos.composites.list_versions(composite.id).await?);
    }
    let composite_items = state.repos.composites.list_all_items().await?;

    let in_use = in_use_versions(&assignments, &versions, &composite_versions, &composite_items);
    let plan = plan(&versions, &in_use, &policy, Utc::now());

    if policy.dry_run {
        return Ok(RetentionReport {
            dry_run: true,
            deleted: plan.delete,
            freed_bytes: 0,
        });
    }

    let mut freed_bytes = 0u64;
    let mut deleted = Vec::new();

    for candidate in plan.delete {
        let files = state
            .repos
            .configurations
            .files_for_version(candidate.version_id)
            .await?;
        let hashes: Vec<String> = files.iter().map(|f| f.content_hash.clone()).collect();

        // Metadata first (the row cascade is transactional), then orphaned
        // blobs; blob deletion is idempotent so a crash between the two
        // steps only leaves garbage, never a dangling reference.
        state
            .repos
            .configurations
            .delete_version(candidate.version_id)
            .await?;

        let remaining = state.repos.configurations.hash_reference_counts(&hashes).await?;
        let still_referenced: HashSet<&String> = remaining
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(hash, _)| hash)
            .collect();
        for hash in &hashes {
            if !still_referenced.contains(hash) {
                freed_bytes += state.content.delete(hash).await?;
            }
        }

        tracing::info!(
            version = %candidate.version,
            configuration_id = %candidate.configuration_id,
            "retention deleted version"
        );
        deleted.push(candidate);
    }

    Ok(RetentionReport {
        dry_run: false,
        deleted,
        freed_bytes,
    })
}

/// Parameter retention is a recognized no-op until the policy is defined;
/// the run still collects schema rows no parameter file references
pub async fn run_parameter_retention(
    state: &AppState,
    policy: RetentionPolicy,
) -> Result<RetentionReport> {
    policy.validate()?;
    tracing::info!("parameter retention requested; policy not yet defined, no versions deleted");

    if !policy.dry_run {
        let collected = state.repos.parameters.collect_orphan_schemas().await?;
        if collected > 0 {
            tracing::info!(collected, "orphaned parameter schemas collected");
        }
    }

    Ok(RetentionReport {
        dry_run: policy.dry_run,
        deleted: Vec::new(),
        freed_bytes: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(configuration_id: Uuid, version: &str, days_old: i64) -> VersionRow {
        VersionRow {
            id: Uuid::new_v4(),
            configuration_id,
            version: version.to_string(),
            is_draft: false,
            is_archived: false,
            created_at: Utc::now() - Duration::days(days_old),
            created_by: String::new(),
        }
    }

    fn assignment(configuration_id: Uuid, pinned: Option<&str>) -> AssignmentRow {
        AssignmentRow {
            node_id: Uuid::new_v4(),
            configuration_id: Some(configuration_id),
            composite_id: None,
            pinned_version: pinned.map(str::to_string),
            use_server_managed_parameters: true,
        }
    }

    #[test]
    fn test_pinned_version_in_use() {
        let config = Uuid::new_v4();
        let versions = vec![version(config, "1.0.0", 100), version(config, "2.0.0", 1)];
        let assignments = vec![assignment(config, Some("1.0.0"))];

        let in_use = in_use_versions(&assignments, &versions, &[], &[]);
        assert!(in_use.contains(&versions[0].id));
        assert!(!in_use.contains(&versions[1].id));
    }

    #[test]
    fn test_null_pin_marks_latest_in_use() {
        let config = Uuid::new_v4();
        let versions = vec![version(config, "1.0.0", 100), version(config, "2.0.0", 1)];
        let assignments = vec![assignment(config, None)];

        let in_use = in_use_versions(&assignments, &versions, &[], &[]);
        assert!(in_use.contains(&versions[1].id));
        assert!(!in_use.contains(&versions[0].id));
    }

    #[test]
    fn test_composite_child_in_use() {
        let child = Uuid::new_v4();
        let composite = Uuid::new_v4();
        let child_versions = vec![version(child, "2.1.0", 50)];
        let composite_version = CompositeVersionRow {
            id: Uuid::new_v4(),
            composite_id: composite,
            version: "1.0.0".into(),
            is_draft: false,
            is_archived: false,
            created_at: Utc::now(),
            created_by: String::new(),
        };
        let items = vec![CompositeItemRow {
            id: Uuid::new_v4(),
            composite_version_id: composite_version.id,
            child_configuration_id: child,
            pinned_version: Some("2.1.0".into()),
            item_order: 1,
        }];
        let assignments = vec![AssignmentRow {
            node_id: Uuid::new_v4(),
            configuration_id: None,
            composite_id: Some(composite),
            pinned_version: None,
            use_server_managed_parameters: true,
        }];

        let in_use = in_use_versions(&assignments, &child_versions, &[composite_version], &items);
        assert!(in_use.contains(&child_versions[0].id));
    }

    #[test]
    fn test_plan_keeps_in_use_even_when_old() {
        let config = Uuid::new_v4();
        let versions = vec![
            version(config, "1.0.0", 400),
            version(config, "2.0.0", 5),
            version(config, "3.0.0", 1),
        ];
        let mut in_use = HashSet::new();
        in_use.insert(versions[0].id);

        let policy = RetentionPolicy { keep_versions: 1, keep_days: 7, dry_run: true };
        let plan = plan(&versions, &in_use, &policy, Utc::now());

        // 1.0.0 is old and beyond keep-1 but in use: never deleted.
        assert!(plan.delete.iter().all(|d| d.version_id != versions[0].id));
        assert!(plan.kept.iter().any(|(id, r)| *id == versions[0].id && *r == KeepReason::InUse));
    }

    #[test]
    fn test_plan_keep_count_and_age() {
        let config = Uuid::new_v4();
        let versions = vec![
            version(config, "1.0.0", 400), // old, beyond count -> delete
            version(config, "2.0.0", 10),  // beyond count, within 30 days -> keep (age)
            version(config, "3.0.0", 1),   // most recent -> keep (count)
        ];
        let policy = RetentionPolicy { keep_versions: 1, keep_days: 30, dry_run: true };
        let plan = plan(&versions, &HashSet::new(), &policy, Utc::now());

        assert_eq!(plan.delete.len(), 1);
        assert_eq!(plan.delete[0].version, "1.0.0");
        assert!(plan.kept.iter().any(|(id, r)| *id == versions[1].id && *r == KeepReason::RecentAge));
        assert!(plan.kept.iter().any(|(id, r)| *id == versions[2].id && *r == KeepReason::RecentCount));
    }

    #[test]
    fn test_plan_zero_keep_days_disables_age_rule() {
        let config = Uuid::new_v4();
        let versions = vec![version(config, "1.0.0", 0), version(config, "2.0.0", 0)];
        let policy = RetentionPolicy { keep_versions: 1, keep_days: 0, dry_run: true };
        let plan = plan(&versions, &HashSet::new(), &policy, Utc::now());

        // Only keep-count protects; the second version is deletable even
        // though it was created today.
        assert_eq!(plan.delete.len(), 1);
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetentionPolicy { keep_versions: 0, keep_days: 0, dry_run: true }
            .validate()
            .is_err());
        assert!(RetentionPolicy { keep_versions: 1, keep_days: 0, dry_run: true }
            .validate()
            .is_ok());
    }
}
