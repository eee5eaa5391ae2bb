//! Client certificate parsing
//!
//! The node identity is the SHA-256 fingerprint of the certificate's
//! subjectPublicKeyInfo, lowercase hex. The mTLS terminator passes the
//! verified client certificate as a URL-encoded PEM header; registration
//! and rotation requests carry the PEM in the JSON body.

use chrono::{DateTime, TimeZone, Utc};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use opendsc_core::{Error, Result};

/// Fields extracted from a client certificate
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    /// SHA-256 of the subjectPublicKeyInfo, lowercase hex
    pub fingerprint: String,
    /// Subject distinguished name
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Parse a PEM-encoded certificate
pub fn parse_certificate_pem(pem: &str) -> Result<ParsedCertificate> {
    let (_, parsed_pem) = parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::Validation(format!("invalid certificate PEM: {}", e)))?;
    let cert = parsed_pem
        .parse_x509()
        .map_err(|e| Error::Validation(format!("invalid certificate: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(cert.public_key().raw);
    let fingerprint = hex::encode(hasher.finalize());

    Ok(ParsedCertificate {
        fingerprint,
        subject: cert.subject().to_string(),
        not_before: timestamp(cert.validity().not_before)?,
        not_after: timestamp(cert.validity().not_after)?,
    })
}

fn timestamp(time: ASN1Time) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(time.timestamp(), 0)
        .single()
        .ok_or_else(|| Error::Validation("certificate validity out of range".into()))
}

/// Decode the URL-encoded PEM a TLS terminator puts in a header
pub fn decode_cert_header(raw: &str) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_digit(bytes.get(i + 1).copied())?;
                let lo = hex_digit(bytes.get(i + 2).copied())?;
                out.push(hi * 16 + lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| Error::Validation("certificate header is not UTF-8".into()))
}

fn hex_digit(byte: Option<u8>) -> Result<u8> {
    match byte {
        Some(b @ b'0'..=b'9') => Ok(b - b'0'),
        Some(b @ b'a'..=b'f') => Ok(b - b'a' + 10),
        Some(b @ b'A'..=b'F') => Ok(b - b'A' + 10),
        _ => Err(Error::Validation("invalid percent escape".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_cert_header() {
        let decoded = decode_cert_header(
            "-----BEGIN%20CERTIFICATE-----%0AMIIB%0A-----END%20CERTIFICATE-----%0A",
        )
        .unwrap();
        assert!(decoded.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(decoded.contains("MIIB"));
    }

    #[test]
    fn test_decode_rejects_bad_escape() {
        assert!(decode_cert_header("abc%zz").is_err());
        assert!(decode_cert_header("abc%0").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_certificate_pem("not a certificate").is_err());
    }
}
