//! Client certificate management
//!
//! Managed mode keeps a self-signed client certificate (90-day validity)
//! under the agent data directory, regenerating it for rotation once two
//! thirds of its lifetime has elapsed. Files are written through a temp
//! file and rename so a crash never leaves a half-written key behind.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, TimeZone, Utc};
use rcgen::{CertificateParams, DnType, KeyPair};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use opendsc_core::{Error, Result};

const CERT_FILE: &str = "client.crt";
const KEY_FILE: &str = "client.key";
const DEFAULT_VALIDITY_DAYS: i64 = 90;

/// A loaded or generated client certificate
#[derive(Debug, Clone)]
pub struct ManagedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    /// SHA-256 of the subjectPublicKeyInfo, lowercase hex
    pub fingerprint: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl ManagedCertificate {
    /// Whether rotation is due: two thirds of the lifetime has elapsed
    pub fn rotation_due(&self, now: DateTime<Utc>) -> bool {
        let lifetime = self.not_after - self.not_before;
        now >= self.not_before + lifetime * 2 / 3
    }

    /// Key and certificate concatenated for a TLS client identity
    pub fn identity_pem(&self) -> String {
        format!("{}{}", self.key_pem, self.cert_pem)
    }
}

/// Manages the certificate files under one directory
pub struct CertificateManager {
    dir: PathBuf,
    fqdn: String,
    validity_days: i64,
}

impl CertificateManager {
    pub fn new(dir: impl Into<PathBuf>, fqdn: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            fqdn: fqdn.into(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }

    /// Load the persisted certificate, or generate and persist a fresh one
    pub fn load_or_generate(&self) -> Result<ManagedCertificate> {
        match self.load()? {
            Some(existing) => Ok(existing),
            None => {
                tracing::info!(fqdn = %self.fqdn, "no client certificate found, generating");
                let fresh = self.generate()?;
                self.persist(&fresh)?;
                Ok(fresh)
            }
        }
    }

    /// Load the persisted pair if both files exist
    pub fn load(&self) -> Result<Option<ManagedCertificate>> {
        let cert_path = self.dir.join(CERT_FILE);
        let key_path = self.dir.join(KEY_FILE);
        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }
        let cert_pem = std::fs::read_to_string(&cert_path)?;
        let key_pem = std::fs::read_to_string(&key_path)?;
        Ok(Some(from_pems(cert_pem, key_pem)?))
    }

    /// Generate a fresh self-signed certificate for this node
    pub fn generate(&self) -> Result<ManagedCertificate> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Validation(format!("cannot generate key pair: {}", e)))?;

        let mut params = CertificateParams::new(vec![self.fqdn.clone()])
            .map_err(|e| Error::Validation(format!("invalid certificate subject: {}", e)))?;
        params
            .distinguished_name
            .push(DnType::CommonName, self.fqdn.clone());
        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + ::time::Duration::days(self.validity_days);

        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Validation(format!("cannot self-sign certificate: {}", e)))?;

        from_pems(certificate.pem(), key_pair.serialize_pem())
    }

    /// Persist a certificate pair atomically
    pub fn persist(&self, certificate: &ManagedCertificate) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        write_atomic(&self.dir, &self.dir.join(CERT_FILE), certificate.cert_pem.as_bytes())?;
        write_atomic(&self.dir, &self.dir.join(KEY_FILE), certificate.key_pem.as_bytes())?;
        Ok(())
    }

    /// Load a platform-provided identity from a PEM file holding both the
    /// private key and the certificate
    pub fn load_platform(path: &Path) -> Result<ManagedCertificate> {
        let combined = std::fs::read_to_string(path)?;
        let cert_start = combined.find("-----BEGIN CERTIFICATE-----").ok_or_else(|| {
            Error::Validation(format!("{} holds no certificate", path.display()))
        })?;
        let key_pem = combined[..cert_start].to_string();
        let cert_pem = combined[cert_start..].to_string();
        if key_pem.trim().is_empty() {
            return Err(Error::Validation(format!(
                "{} holds no private key",
                path.display()
            )));
        }
        from_pems(cert_pem, key_pem)
    }
}

fn write_atomic(dir: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::TransientIo(format!("create temp file: {}", e)))?;
    std::fs::write(tmp.path(), bytes)?;
    tmp.persist(target)
        .map_err(|e| Error::TransientIo(format!("persist {}: {}", target.display(), e)))?;
    Ok(())
}

fn from_pems(cert_pem: String, key_pem: String) -> Result<ManagedCertificate> {
    let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| Error::Validation(format!("invalid certificate PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::Validation(format!("invalid certificate: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(cert.public_key().raw);
    let fingerprint = hex::encode(hasher.finalize());

    let not_before = Utc
        .timestamp_opt(cert.validity().not_before.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::Validation("certificate validity out of range".into()))?;
    let not_after = Utc
        .timestamp_opt(cert.validity().not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::Validation("certificate validity out of range".into()))?;

    Ok(ManagedCertificate {
        cert_pem,
        key_pem,
        fingerprint,
        not_before,
        not_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &Path) -> CertificateManager {
        CertificateManager::new(dir, "web-1.example.org")
    }

    #[test]
    fn test_generate_has_90_day_validity() {
        let dir = tempfile::tempdir().unwrap();
        let cert = manager(dir.path()).generate().unwrap();

        let lifetime = cert.not_after - cert.not_before;
        assert_eq!(lifetime.num_days(), 90);
        assert_eq!(cert.fingerprint.len(), 64);
    }

    #[test]
    fn test_load_or_generate_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let first = manager.load_or_generate().unwrap();
        let second = manager.load_or_generate().unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_rotation_due_after_two_thirds() {
        let dir = tempfile::tempdir().unwrap();
        let cert = manager(dir.path()).generate().unwrap();

        assert!(!cert.rotation_due(cert.not_before + Duration::days(30)));
        assert!(!cert.rotation_due(cert.not_before + Duration::days(59)));
        assert!(cert.rotation_due(cert.not_before + Duration::days(61)));
        assert!(cert.rotation_due(cert.not_after));
    }

    #[test]
    fn test_fresh_generation_differs() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let a = manager.generate().unwrap();
        let b = manager.generate().unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn test_identity_pem_holds_key_and_cert() {
        let dir = tempfile::tempdir().unwrap();
        let cert = manager(dir.path()).generate().unwrap();
        let identity = cert.identity_pem();
        assert!(identity.contains("PRIVATE KEY"));
        assert!(identity.contains("BEGIN CERTIFICATE"));
    }
}
