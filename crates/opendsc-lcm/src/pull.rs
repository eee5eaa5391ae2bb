//! Pull Server client
//!
//! Registers the node, checks the manifest checksum before downloading,
//! streams and verifies the bundle, extracts it atomically, rotates the
//! client certificate when due, and submits compliance reports. All calls
//! run over mTLS with the managed (or platform-provided) client identity.

use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use opendsc_core::wire::{
    ChecksumResponse, ComplianceReportRequest, RegisterRequest, RegisterResponse,
    RotateCertificateRequest,
};
use opendsc_core::{Error, Result};

use crate::certs::{CertificateManager, ManagedCertificate};
use crate::settings::{CertificateSource, PullServerSettings};

const BUNDLE_DIR: &str = "bundle";
const STAGING_DIR: &str = "bundle-staging";
const OLD_DIR: &str = "bundle-old";
const STATE_FILE: &str = "pull-state.json";

/// Seam for the worker: resolve the configuration and talk to the server
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Refresh the local bundle if the server's checksum changed; returns
    /// the path of the entry-point file
    async fn refresh(&self) -> Result<PathBuf>;

    /// Submit a compliance report
    async fn submit_report(&self, report: &ComplianceReportRequest) -> Result<()>;

    /// Rotate the client certificate when two thirds of its lifetime passed
    async fn rotate_if_due(&self) -> Result<()>;
}

/// Persisted client state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PullState {
    node_id: Option<Uuid>,
    checksum: Option<String>,
    entry_point: Option<String>,
}

struct Inner {
    http: reqwest::Client,
    certificate: ManagedCertificate,
    state: PullState,
}

/// The real Pull Server client
pub struct PullClient {
    settings: PullServerSettings,
    data_dir: PathBuf,
    fqdn: String,
    cert_manager: CertificateManager,
    inner: Mutex<Inner>,
}

impl PullClient {
    pub fn new(settings: PullServerSettings, data_dir: PathBuf, fqdn: String) -> Result<Self> {
        let cert_manager = CertificateManager::new(data_dir.join("certs"), fqdn.clone());
        let certificate = match settings.certificate_source {
            CertificateSource::Managed => cert_manager.load_or_generate()?,
            CertificateSource::Platform => {
                let path = settings.certificate_path.as_ref().ok_or_else(|| {
                    Error::Validation("platform certificate path missing".into())
                })?;
                CertificateManager::load_platform(path)?
            }
        };

        let http = build_http(&certificate)?;
        let state = load_state(&data_dir.join(STATE_FILE));

        Ok(Self {
            settings,
            data_dir,
            fqdn,
            cert_manager,
            inner: Mutex::new(Inner {
                http,
                certificate,
                state,
            }),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/api/v1{}",
            self.settings.server_url.trim_end_matches('/'),
            path
        )
    }

    fn state_path(&self) -> PathBuf {
        self.data_dir.join(STATE_FILE)
    }

    async fn ensure_registered(&self, inner: &mut Inner) -> Result<Uuid> {
        if let Some(node_id) = inner.state.node_id {
            return Ok(node_id);
        }

        tracing::info!(fqdn = %self.fqdn, "registering with pull server");
        let request = RegisterRequest {
            registration_key: self.settings.registration_key.clone(),
            fqdn: self.fqdn.clone(),
            certificate_pem: inner.certificate.cert_pem.clone(),
        };
        let response = inner
            .http
            .post(self.url("/nodes/register"))
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = check_status(response).await?;
        let registered: RegisterResponse = response.json().await.map_err(map_reqwest)?;

        inner.state.node_id = Some(registered.node_id);
        save_state(&self.state_path(), &inner.state)?;
        tracing::info!(node_id = %registered.node_id, "node registered");
        Ok(registered.node_id)
    }

    async fn fetch_checksum(&self, inner: &Inner, node_id: Uuid) -> Result<ChecksumResponse> {
        let response = inner
            .http
            .get(self.url(&format!("/nodes/{}/configuration/checksum", node_id)))
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = check_status(response).await?;
        response.json().await.map_err(map_reqwest)
    }

    /// Download the bundle to a temp file, verifying size and hash against
    /// the ETag; a mismatch discards the download
    async fn download(&self, inner: &Inner, node_id: Uuid) -> Result<tempfile::NamedTempFile> {
        let response = inner
            .http
            .get(self.url(&format!("/nodes/{}/configuration", node_id)))
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = check_status(response).await?;

        let expected = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        let mut spool = tempfile::NamedTempFile::new_in(&self.data_dir)
            .map_err(|e| Error::TransientIo(format!("create download spool: {}", e)))?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest)?;
            hasher.update(&chunk);
            spool
                .write_all(&chunk)
                .map_err(|e| Error::TransientIo(format!("write download spool: {}", e)))?;
        }
        spool
            .flush()
            .map_err(|e| Error::TransientIo(format!("flush download spool: {}", e)))?;

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = expected {
            if expected != actual {
                return Err(Error::Integrity(format!(
                    "bundle hash mismatch: expected {}, downloaded {}",
                    expected, actual
                )));
            }
        }
        Ok(spool)
    }

    /// Extract to a staging directory and swap into place only after the
    /// entry-point file is verified to exist
    async fn extract_and_swap(
        &self,
        archive: tempfile::NamedTempFile,
        entry_point: &str,
    ) -> Result<PathBuf> {
        let staging = self.data_dir.join(STAGING_DIR);
        let bundle = self.data_dir.join(BUNDLE_DIR);
        let old = self.data_dir.join(OLD_DIR);
        let entry_name = entry_point.to_string();

        let staging_clone = staging.clone();
        tokio::task::spawn_blocking(move || extract_archive(archive.path(), &staging_clone))
            .await
            .map_err(|e| Error::TransientIo(format!("extract task: {}", e)))??;

        if !staging.join(entry_point).exists() {
            tokio::fs::remove_dir_all(&staging).await.ok();
            return Err(Error::Integrity(format!(
                "extracted bundle is missing its entry point {}",
                entry_name
            )));
        }

        if old.exists() {
            tokio::fs::remove_dir_all(&old).await?;
        }
        if bundle.exists() {
            tokio::fs::rename(&bundle, &old).await?;
        }
        tokio::fs::rename(&staging, &bundle).await?;
        tokio::fs::remove_dir_all(&old).await.ok();

        Ok(bundle.join(entry_point))
    }
}

fn build_http(certificate: &ManagedCertificate) -> Result<reqwest::Client> {
    let identity = reqwest::Identity::from_pem(certificate.identity_pem().as_bytes())
        .map_err(|e| Error::Validation(format!("invalid client identity: {}", e)))?;
    reqwest::Client::builder()
        .identity(identity)
        .use_rustls_tls()
        .build()
        .map_err(|e| Error::Validation(format!("cannot build http client: {}", e)))
}

fn extract_archive(archive_path: &Path, staging: &Path) -> Result<()> {
    if staging.exists() {
        std::fs::remove_dir_all(staging)?;
    }
    std::fs::create_dir_all(staging)?;

    let file = std::fs::File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| Error::Integrity(format!("unreadable bundle archive: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| Error::Integrity(format!("unreadable bundle entry: {}", e)))?;
        // enclosed_name rejects absolute paths and traversal.
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| Error::Integrity(format!("unsafe bundle path {:?}", entry.name())))?;
        let target = staging.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

fn load_state(path: &Path) -> PullState {
    std::fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        .unwrap_or_default()
}

fn save_state(path: &Path, state: &PullState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = serde_json::to_vec_pretty(state)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Whether a bundle download is needed: the server checksum differs from
/// the stored one, or the local bundle lost its entry point
fn should_download(stored: Option<&str>, server_checksum: &str, entry_exists: bool) -> bool {
    stored != Some(server_checksum) || !entry_exists
}

fn map_reqwest(err: reqwest::Error) -> Error {
    Error::TransientIo(format!("pull server request failed: {}", err))
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("pull server returned {}: {}", status, body);
    match status.as_u16() {
        401 => Err(Error::Unauthorized(message)),
        403 => Err(Error::Forbidden(message)),
        404 => Err(Error::NotFound(message)),
        _ => Err(Error::TransientIo(message)),
    }
}

#[async_trait]
impl BundleSource for PullClient {
    async fn refresh(&self) -> Result<PathBuf> {
        let mut inner = self.inner.lock().await;
        let node_id = self.ensure_registered(&mut inner).await?;

        let checksum = self.fetch_checksum(&inner, node_id).await?;
        let bundle_entry = self.data_dir.join(BUNDLE_DIR).join(&checksum.entry_point);

        if !should_download(
            inner.state.checksum.as_deref(),
            &checksum.checksum,
            bundle_entry.exists(),
        ) {
            tracing::debug!(checksum = %checksum.checksum, "bundle unchanged, skipping download");
            return Ok(bundle_entry);
        }

        tracing::info!(
            configuration = %checksum.configuration,
            version = %checksum.version,
            "bundle changed, downloading"
        );
        let archive = self.download(&inner, node_id).await?;
        let entry = self.extract_and_swap(archive, &checksum.entry_point).await?;

        inner.state.checksum = Some(checksum.checksum.clone());
        inner.state.entry_point = Some(checksum.entry_point.clone());
        save_state(&self.state_path(), &inner.state)?;

        Ok(entry)
    }

    async fn submit_report(&self, report: &ComplianceReportRequest) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let node_id = self.ensure_registered(&mut inner).await?;

        let response = inner
            .http
            .post(self.url(&format!("/nodes/{}/reports", node_id)))
            .json(report)
            .send()
            .await
            .map_err(map_reqwest)?;
        check_status(response).await?;
        Ok(())
    }

    async fn rotate_if_due(&self) -> Result<()> {
        if self.settings.certificate_source != CertificateSource::Managed {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        if !inner.certificate.rotation_due(Utc::now()) {
            return Ok(());
        }
        let node_id = self.ensure_registered(&mut inner).await?;

        tracing::info!("client certificate reached 2/3 of its lifetime, rotating");
        let replacement = self.cert_manager.generate()?;
        let request = RotateCertificateRequest {
            certificate_pem: replacement.cert_pem.clone(),
        };

        let response = inner
            .http
            .post(self.url(&format!("/nodes/{}/rotate-certificate", node_id)))
            .json(&request)
            .send()
            .await
            .map_err(map_reqwest)?;

        match check_status(response).await {
            Ok(_) => {}
            // A lost response from a previous attempt leaves the server on
            // the new certificate while we still hold the old one; one
            // retry with the replacement identity settles it.
            Err(Error::Unauthorized(_)) => {
                let retry_http = build_http(&replacement)?;
                let response = retry_http
                    .get(self.url(&format!("/nodes/{}/configuration/checksum", node_id)))
                    .send()
                    .await
                    .map_err(map_reqwest)?;
                check_status(response).await?;
                tracing::warn!("previous rotation had already been applied server-side");
            }
            Err(other) => return Err(other),
        }

        self.cert_manager.persist(&replacement)?;
        inner.http = build_http(&replacement)?;
        inner.certificate = replacement;
        tracing::info!("client certificate rotated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(STATE_FILE);

        let state = PullState {
            node_id: Some(Uuid::new_v4()),
            checksum: Some("ab".repeat(32)),
            entry_point: Some("main.dsc.yaml".into()),
        };
        save_state(&path, &state).unwrap();

        let loaded = load_state(&path);
        assert_eq!(loaded.node_id, state.node_id);
        assert_eq!(loaded.checksum, state.checksum);
    }

    #[test]
    fn test_checksum_short_circuit() {
        let checksum = "ab".repeat(32);
        // Same checksum and intact bundle: no download.
        assert!(!should_download(Some(&checksum), &checksum, true));
        // A new activation changed the server checksum: download.
        let changed = "cd".repeat(32);
        assert!(should_download(Some(&checksum), &changed, true));
        // Matching checksum but the local bundle lost its entry point.
        assert!(should_download(Some(&checksum), &checksum, false));
        // Nothing stored yet.
        assert!(should_download(None, &checksum, true));
    }

    #[test]
    fn test_missing_state_is_default() {
        let loaded = load_state(Path::new("/nonexistent/pull-state.json"));
        assert!(loaded.node_id.is_none());
    }

    #[test]
    fn test_extract_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();

        // Hand-build an archive holding a traversal path.
        let archive_path = dir.path().join("evil.zip");
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("../evil.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"evil").unwrap();
        writer.finish().unwrap();

        let staging = dir.path().join("staging");
        let err = extract_archive(&archive_path, &staging).unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_extract_roundtrip() {
        let dir = tempfile::tempdir().unwrap();

        let archive_path = dir.path().join("bundle.zip");
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file("main.dsc.yaml", options).unwrap();
        writer.write_all(b"resources: []\n").unwrap();
        writer.start_file("lib/util.yaml", options).unwrap();
        writer.write_all(b"util: true\n").unwrap();
        writer.finish().unwrap();

        let staging = dir.path().join("staging");
        extract_archive(&archive_path, &staging).unwrap();

        assert!(staging.join("main.dsc.yaml").exists());
        assert!(staging.join("lib/util.yaml").exists());
    }
}
