//! Bundle builder
//!
//! Materializes the files of a resolved configuration version (or the
//! orchestrator plus children for a composite) and the merged
//! `parameters.yaml` into a deterministic ZIP archive: entries sorted
//! ASCII-ascending, fixed modification times, fixed compression. The
//! archive checksum is SHA-256 of the archive bytes; the manifest checksum
//! is the cheap change detector computed from the entry listing alone.

use std::io::{Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};
use uuid::Uuid;

use opendsc_core::manifest::{manifest_checksum, sha256_hex};
use opendsc_core::naming::normalize_relative_path;
use opendsc_core::version::{latest, Version, VersionCandidate};
use opendsc_core::{Error, Result};
use opendsc_storage::postgres::configurations::VersionRow;
use opendsc_storage::postgres::nodes::AssignmentRow;

use crate::services::merge;
use crate::state::AppState;

/// One archive entry, already loaded
#[derive(Debug, Clone)]
pub struct BundleEntry {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// A fully resolved bundle, ready to serialize
#[derive(Debug, Clone)]
pub struct ResolvedBundle {
    /// Name of the configuration or composite
    pub name: String,
    /// Resolved version string
    pub version: String,
    /// Entry-point file name at the archive root
    pub entry_point: String,
    /// Entries sorted ASCII-ascending by path
    pub entries: Vec<BundleEntry>,
}

impl ResolvedBundle {
    /// The manifest checksum of this bundle
    pub fn manifest_checksum(&self) -> String {
        let files: Vec<(String, String)> = self
            .entries
            .iter()
            .map(|e| (e.path.clone(), sha256_hex(&e.bytes)))
            .collect();
        manifest_checksum(&self.version, &files)
    }
}

/// A serialized archive spooled to a temp file
pub struct BuiltArchive {
    /// Spool file, rewound to the start
    pub file: std::fs::File,
    /// SHA-256 of the archive bytes
    pub archive_checksum: String,
    /// Archive size in bytes
    pub size: u64,
}

/// Pick the version a reference resolves to: the pinned version, or the
/// latest published one
pub fn resolve_version(rows: &[VersionRow], pinned: Option<&str>) -> Result<VersionRow> {
    match pinned {
        Some(pinned) => {
            let row = rows
                .iter()
                .find(|r| r.version == pinned)
                .ok_or_else(|| Error::NotFound(format!("version {}", pinned)))?;
            if row.is_archived {
                return Err(Error::Archived(format!("version {} is archived", pinned)));
            }
            if row.is_draft {
                return Err(Error::Conflict(format!("version {} is a draft", pinned)));
            }
            Ok(row.clone())
        }
        None => {
            let candidates: Vec<VersionCandidate> = rows
                .iter()
                .filter_map(|r| {
                    r.version.parse::<Version>().ok().map(|version| VersionCandidate {
                        version,
                        is_draft: r.is_draft,
                        is_archived: r.is_archived,
                    })
                })
                .collect();
            let winner = latest(&candidates, false)?;
            let version_string = winner.to_string();
            rows.iter()
                .find(|r| r.version == version_string)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("version {}", version_string)))
        }
    }
}

/// Resolve the bundle for a node's assignment
pub async fn resolve_for_assignment(
    state: &AppState,
    assignment: &AssignmentRow,
    node_id: Uuid,
    fqdn: &str,
) -> Result<ResolvedBundle> {
    match (assignment.configuration_id, assignment.composite_id) {
        (Some(configuration_id), None) => {
            resolve_configuration_bundle(
                state,
                configuration_id,
                assignment.pinned_version.as_deref(),
                node_id,
                fqdn,
                assignment.use_server_managed_parameters,
            )
            .await
        }
        (None, Some(composite_id)) => {
            resolve_composite_bundle(
                state,
                composite_id,
                assignment.pinned_version.as_deref(),
                node_id,
                fqdn,
                assignment.use_server_managed_parameters,
            )
            .await
        }
        _ => Err(Error::Validation("assignment has no target".into())),
    }
}

/// Resolve a regular configuration bundle
pub async fn resolve_configuration_bundle(
    state: &AppState,
    configuration_id: Uuid,
    pinned: Option<&str>,
    node_id: Uuid,
    fqdn: &str,
    use_server_managed: bool,
) -> Result<ResolvedBundle> {
    let configuration = state
        .repos
        .configurations
        .get(configuration_id)
        .await?
        .ok_or_else(|| Error::NotFound("configuration".into()))?;

    let versions = state.repos.configurations.list_versions(configuration_id).await?;
    let version = resolve_version(&versions, pinned)?;

    let mut entries = load_version_entries(state, version.id, "").await?;

    if let Some(merged) =
        merge::effective_parameters(state, configuration_id, node_id, fqdn, use_server_managed)
            .await?
    {
        entries.push(BundleEntry {
            path: "parameters.yaml".to_string(),
            bytes: merged.yaml.into_bytes(),
        });
    }

    entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));

    Ok(ResolvedBundle {
        name: configuration.name,
        version: version.version,
        entry_point: configuration.entry_point,
        entries,
    })
}

/// Resolve a composite bundle: each child under a subdirectory named after
/// the child configuration, plus a generated orchestrator at the root
pub async fn resolve_composite_bundle(
    state: &AppState,
    composite_id: Uuid,
    pinned: Option<&str>,
    node_id: Uuid,
    fqdn: &str,
    use_server_managed: bool,
) -> Result<ResolvedBundle> {
    let composite = state
        .repos
        .composites
        .get(composite_id)
        .await?
        .ok_or_else(|| Error::NotFound("composite configuration".into()))?;

    let versions = state.repos.composites.list_versions(composite_id).await?;
    let composite_versions: Vec<VersionRow> = versions
        .iter()
        .map(|v| VersionRow {
            id: v.id,
            configuration_id: v.composite_id,
            version: v.version.clone(),
            is_draft: v.is_draft,
            is_archived: v.is_archived,
            created_at: v.created_at,
            created_by: v.created_by.clone(),
        })
        .collect();
    let resolved = resolve_version(&composite_versions, pinned)?;

    let items = state.repos.composites.items_for_version(resolved.id).await?;

    let mut entries = Vec::new();
    let mut children = Vec::new();

    for item in &items {
        let child = state
            .repos
            .configurations
            .get(item.child_configuration_id)
            .await?
            .ok_or_else(|| Error::NotFound("child configuration".into()))?;

        let child_versions = state
            .repos
            .configurations
            .list_versions(child.id)
            .await?;
        let child_version = resolve_version(&child_versions, item.pinned_version.as_deref())?;

        let prefix = format!("{}/", child.name);
        entries.extend(load_version_entries(state, child_version.id, &prefix).await?);

        let merged =
            merge::effective_parameters(state, child.id, node_id, fqdn, use_server_managed).await?;
        let has_parameters = merged.is_some();
        if let Some(merged) = merged {
            entries.push(BundleEntry {
                path: format!("{}parameters.yaml", prefix),
                bytes: merged.yaml.into_bytes(),
            });
        }

        children.push(OrchestratorChild {
            name: child.name,
            entry_point: child.entry_point,
            version: child_version.version,
            has_parameters,
        });
    }

    entries.push(BundleEntry {
        path: composite.entry_point.clone(),
        bytes: render_orchestrator(&composite.name, &resolved.version, &children).into_bytes(),
    });

    entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));

    Ok(ResolvedBundle {
        name: composite.name,
        version: resolved.version,
        entry_point: composite.entry_point,
        entries,
    })
}

async fn load_version_entries(
    state: &AppState,
    version_id: Uuid,
    prefix: &str,
) -> Result<Vec<BundleEntry>> {
    let files = state.repos.configurations.files_for_version(version_id).await?;
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        // Path policy was enforced at upload; re-check before serving.
        let relative = normalize_relative_path(&file.path)?;
        let bytes = state.content.get_required(&file.content_hash).await?;
        entries.push(BundleEntry {
            path: format!("{}{}", prefix, relative),
            bytes,
        });
    }
    Ok(entries)
}

/// One child reference in the generated orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorChild {
    pub name: String,
    pub entry_point: String,
    pub version: String,
    pub has_parameters: bool,
}

/// Render the orchestrator document listing children in declared order
pub fn render_orchestrator(name: &str, version: &str, children: &[OrchestratorChild]) -> String {
    let mut out = String::new();
    out.push_str("# Generated orchestrator; children apply in listed order\n");
    out.push_str(&format!("name: {}\n", name));
    out.push_str(&format!("version: {}\n", version));
    out.push_str("resources:\n");
    for child in children {
        out.push_str(&format!("  - name: {}\n", child.name));
        out.push_str("    type: OpenDSC.Composite/Include\n");
        out.push_str("    properties:\n");
        out.push_str(&format!(
            "      configurationFile: {}/{}\n",
            child.name, child.entry_point
        ));
        if child.has_parameters {
            out.push_str(&format!(
                "      parametersFile: {}/parameters.yaml\n",
                child.name
            ));
        }
        out.push_str(&format!("      resolvedVersion: {}\n", child.version));
    }
    out
}

/// Serialize a resolved bundle into a spooled ZIP archive
///
/// The archive bytes land in an unnamed temp file; the checksum is computed
/// by streaming the file back through a hasher, so the whole archive is
/// never buffered in memory.
pub async fn write_archive(bundle: ResolvedBundle) -> Result<BuiltArchive> {
    tokio::task::spawn_blocking(move || write_archive_blocking(&bundle))
        .await
        .map_err(|e| Error::TransientIo(format!("archive task: {}", e)))?
}

fn write_archive_blocking(bundle: &ResolvedBundle) -> Result<BuiltArchive> {
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    let spool = tempfile::tempfile().map_err(|e| Error::TransientIo(format!("spool: {}", e)))?;
    let mut writer = ZipWriter::new(spool);

    // Fixed timestamp and compression keep the archive reproducible.
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    for entry in &bundle.entries {
        writer
            .start_file(entry.path.as_str(), options)
            .map_err(|e| Error::TransientIo(format!("zip entry {}: {}", entry.path, e)))?;
        writer
            .write_all(&entry.bytes)
            .map_err(|e| Error::TransientIo(format!("zip entry {}: {}", entry.path, e)))?;
    }

    let mut file = writer
        .finish()
        .map_err(|e| Error::TransientIo(format!("finish zip: {}", e)))?;

    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size: u64 = 0;
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }
    file.seek(SeekFrom::Start(0))?;

    Ok(BuiltArchive {
        file,
        archive_checksum: hex::encode(hasher.finalize()),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn version_row(version: &str, is_draft: bool, is_archived: bool) -> VersionRow {
        VersionRow {
            id: Uuid::new_v4(),
            configuration_id: Uuid::new_v4(),
            version: version.to_string(),
            is_draft,
            is_archived,
            created_at: Utc::now(),
            created_by: String::new(),
        }
    }

    #[test]
    fn test_resolve_pinned() {
        let rows = vec![version_row("1.0.0", false, false), version_row("2.0.0", false, false)];
        assert_eq!(resolve_version(&rows, Some("1.0.0")).unwrap().version, "1.0.0");
    }

    #[test]
    fn test_resolve_pinned_draft_refused() {
        let rows = vec![version_row("1.0.0", true, false)];
        assert!(resolve_version(&rows, Some("1.0.0")).unwrap_err().is_conflict());
    }

    #[test]
    fn test_resolve_pinned_archived_refused() {
        let rows = vec![version_row("1.0.0", false, true)];
        assert!(matches!(
            resolve_version(&rows, Some("1.0.0")).unwrap_err(),
            Error::Archived(_)
        ));
    }

    #[test]
    fn test_resolve_latest_skips_drafts_and_prereleases() {
        let rows = vec![
            version_row("1.0.0", false, false),
            version_row("1.2.0", false, false),
            version_row("2.0.0", true, false),
            version_row("1.3.0-rc.1", false, false),
        ];
        assert_eq!(resolve_version(&rows, None).unwrap().version, "1.2.0");
    }

    #[test]
    fn test_resolve_latest_none_published() {
        let rows = vec![version_row("1.0.0", true, false)];
        assert!(resolve_version(&rows, None).unwrap_err().is_not_found());
    }

    #[test]
    fn test_manifest_checksum_ignores_entry_order() {
        let a = ResolvedBundle {
            name: "Web".into(),
            version: "1.0.0".into(),
            entry_point: "main.dsc.yaml".into(),
            entries: vec![
                BundleEntry { path: "a.yaml".into(), bytes: b"a".to_vec() },
                BundleEntry { path: "b.yaml".into(), bytes: b"b".to_vec() },
            ],
        };
        let mut b = a.clone();
        b.entries.reverse();
        assert_eq!(a.manifest_checksum(), b.manifest_checksum());
    }

    #[test]
    fn test_composite_entry_order_is_ascii() {
        // Child subdirectories sort before the root orchestrator because
        // uppercase letters precede lowercase in ASCII.
        let mut entries = vec![
            BundleEntry { path: "main.dsc.yaml".into(), bytes: Vec::new() },
            BundleEntry { path: "WebServer/parameters.yaml".into(), bytes: Vec::new() },
            BundleEntry { path: "Database/main.dsc.yaml".into(), bytes: Vec::new() },
            BundleEntry { path: "WebServer/main.dsc.yaml".into(), bytes: Vec::new() },
            BundleEntry { path: "Database/parameters.yaml".into(), bytes: Vec::new() },
        ];
        entries.sort_by(|a, b| a.path.as_bytes().cmp(b.path.as_bytes()));

        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "Database/main.dsc.yaml",
                "Database/parameters.yaml",
                "WebServer/main.dsc.yaml",
                "WebServer/parameters.yaml",
                "main.dsc.yaml",
            ]
        );
    }

    #[test]
    fn test_orchestrator_rendering_order() {
        let children = vec![
            OrchestratorChild {
                name: "Database".into(),
                entry_point: "main.dsc.yaml".into(),
                version: "2.1.0".into(),
                has_parameters: true,
            },
            OrchestratorChild {
                name: "WebServer".into(),
                entry_point: "main.dsc.yaml".into(),
                version: "1.2.0".into(),
                has_parameters: true,
            },
        ];
        let rendered = render_orchestrator("FullWebStack", "1.0.0", &children);
        let db_pos = rendered.find("name: Database").unwrap();
        let web_pos = rendered.find("name: WebServer").unwrap();
        assert!(db_pos < web_pos);
        assert!(rendered.contains("configurationFile: Database/main.dsc.yaml"));
        assert!(rendered.contains("parametersFile: Database/parameters.yaml"));
    }

    #[tokio::test]
    async fn test_archive_determinism() {
        let bundle = ResolvedBundle {
            name: "Web".into(),
            version: "1.0.0".into(),
            entry_point: "main.dsc.yaml".into(),
            entries: vec![
                BundleEntry { path: "lib/util.yaml".into(), bytes: b"util: true\n".to_vec() },
                BundleEntry { path: "main.dsc.yaml".into(), bytes: b"resources: []\n".to_vec() },
            ],
        };

        let first = write_archive(bundle.clone()).await.unwrap();
        let second = write_archive(bundle).await.unwrap();
        assert_eq!(first.archive_checksum, second.archive_checksum);
        assert_eq!(first.size, second.size);
        assert!(first.size > 0);
    }

    #[tokio::test]
    async fn test_archive_entries_readable() {
        let bundle = ResolvedBundle {
            name: "Web".into(),
            version: "1.0.0".into(),
            entry_point: "main.dsc.yaml".into(),
            entries: vec![BundleEntry {
                path: "main.dsc.yaml".into(),
                bytes: b"resources: []\n".to_vec(),
            }],
        };

        let built = write_archive(bundle).await.unwrap();
        let mut archive = zip::ZipArchive::new(built.file).unwrap();
        assert_eq!(archive.len(), 1);
        let mut entry = archive.by_index(0).unwrap();
        assert_eq!(entry.name(), "main.dsc.yaml");
        let mut content = String::new();
        entry.read_to_string(&mut content).unwrap();
        assert_eq!(content, "resources: []\n");
    }
}
