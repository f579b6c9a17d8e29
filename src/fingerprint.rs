//! Certificate Fingerprints
//!
//! A fingerprint is the SHA-256 digest of a certificate's full DER encoding,
//! rendered as 64 lowercase hex characters. It is the value an operator
//! compares out of band before pinning a server.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use crate::tls::load_certs;

/// Length of a rendered fingerprint in hex characters
pub const FINGERPRINT_LEN: usize = 64;

/// Compute the fingerprint of a DER-encoded certificate
pub fn fingerprint(der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(der);
    hex::encode(hasher.finalize())
}

/// Fingerprint of the first certificate in a PEM file
pub fn fingerprint_from_path(cert_path: &Path) -> Result<String> {
    let certs = load_certs(cert_path)?;
    let leaf = certs
        .first()
        .with_context(|| format!("No certificate in {:?}", cert_path))?;
    Ok(fingerprint(leaf.as_ref()))
}

/// Normalize an operator-supplied fingerprint for comparison.
///
/// Accepts upper or lower case and the common `aa:bb:cc` separator styles.
pub fn normalize(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, ':' | ' ' | '-'))
        .collect::<String>()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let der = b"not really a certificate but bytes are bytes";
        assert_eq!(fingerprint(der), fingerprint(der));
        assert_eq!(fingerprint(der).len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_fingerprint_changes_with_any_byte() {
        let original = vec![0x30u8, 0x82, 0x01, 0x0a, 0x02, 0x82];
        let mut flipped = original.clone();
        flipped[3] ^= 0x01;
        assert_ne!(fingerprint(&original), fingerprint(&flipped));
    }

    #[test]
    fn test_fingerprint_known_value() {
        assert_eq!(
            fingerprint(b"Hello, World!"),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_fingerprint_from_generated_cert() {
        let dir = tempfile::tempdir().unwrap();
        let cert = crate::tls::generate_self_signed_cert("localhost", &["localhost"], &[]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        std::fs::write(&cert_path, &cert.cert_pem).unwrap();

        let from_path = fingerprint_from_path(&cert_path).unwrap();
        assert_eq!(from_path, fingerprint(cert.cert_der.as_ref()));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("AB:12:cd"), "ab12cd");
        assert_eq!(normalize(" ab12 "), "ab12");
    }
}
