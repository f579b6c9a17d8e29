//! Trust Store
//!
//! Durable, host-addressable record of accepted server certificates. One PEM
//! file per server identity lives in the trust directory:
//!
//! ```text
//! trusted/
//!   example.com_443.pem
//!   127.0.0.1_8443.pem
//!   __1_443.pem            ([::1]:443)
//! ```
//!
//! Records are never edited in place. Saving an identity replaces its whole
//! file (write to a temporary file, then rename), so a reader sees either the
//! old record or the new one.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rustls::pki_types::CertificateDer;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fingerprint::fingerprint;
use crate::tls::{encode_certificate_pem, load_certs_from_pem};

/// Trust establishment and lookup errors
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("server already trusted, fingerprint: {fingerprint}")]
    AlreadyTrusted { fingerprint: String },

    #[error("server {0} is not trusted")]
    NotTrusted(ServerIdentity),

    #[error("certificate of {identity} changed: pinned {saved}, presented {presented}")]
    FingerprintMismatch {
        identity: ServerIdentity,
        saved: String,
        presented: String,
    },

    #[error("user did not confirm fingerprint {fingerprint}")]
    NotConfirmed { fingerprint: String },

    #[error("server {identity} unreachable: {source}")]
    Unreachable {
        identity: ServerIdentity,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {identity} failed: {source}")]
    Handshake {
        identity: ServerIdentity,
        #[source]
        source: io::Error,
    },

    #[error("server {0} presented no certificate")]
    NoCertificate(ServerIdentity),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS setup failed: {0}")]
    Tls(String),

    #[error("trust store I/O error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TrustError {
    fn storage(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Self::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A server as addressed by clients: `(host, port)`
///
/// The host is normalized on construction (trimmed, lowercased, IPv6
/// brackets removed) so the key used to save a record is always the key
/// used to look it up.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerIdentity {
    host: String,
    port: u16,
}

impl ServerIdentity {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        let host = host.as_ref().trim();
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Self {
            host: host.to_ascii_lowercase(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stem of the record file: unsafe host characters become `_`
    pub fn file_stem(&self) -> String {
        let host: String = self
            .host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}_{}", host, self.port)
    }
}

impl fmt::Display for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// An accepted certificate for one server identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRecord {
    pub identity: ServerIdentity,
    pub certificate: CertificateDer<'static>,
    pub fingerprint: String,
}

impl TrustRecord {
    pub fn new(identity: ServerIdentity, certificate: CertificateDer<'static>) -> Self {
        let fingerprint = fingerprint(certificate.as_ref());
        Self {
            identity,
            certificate,
            fingerprint,
        }
    }
}

/// Directory of pinned certificates
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
}

impl TrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, identity: &ServerIdentity) -> PathBuf {
        self.dir.join(format!("{}.pem", identity.file_stem()))
    }

    /// Read the record for an identity.
    ///
    /// A missing record is `Ok(None)`. A record that does not contain a PEM
    /// certificate is also `Ok(None)`: the caller falls back to a fresh
    /// trust prompt, never to silent trust.
    pub fn lookup(&self, identity: &ServerIdentity) -> Result<Option<TrustRecord>, TrustError> {
        let path = self.record_path(identity);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No trust record for {} at {:?}", identity, path);
                return Ok(None);
            }
            Err(e) => return Err(TrustError::storage(&path)(e)),
        };

        let parsed = String::from_utf8(bytes)
            .map_err(anyhow::Error::from)
            .and_then(|pem| load_certs_from_pem(&pem));

        match parsed {
            Ok(mut certs) => {
                let certificate = certs.swap_remove(0);
                Ok(Some(TrustRecord::new(identity.clone(), certificate)))
            }
            Err(e) => {
                warn!("Ignoring malformed trust record {:?}: {:#}", path, e);
                Ok(None)
            }
        }
    }

    /// Pin a certificate for an identity, replacing any previous record
    pub fn save(
        &self,
        identity: &ServerIdentity,
        certificate: CertificateDer<'static>,
    ) -> Result<TrustRecord, TrustError> {
        fs::create_dir_all(&self.dir).map_err(TrustError::storage(&self.dir))?;

        let path = self.record_path(identity);
        let tmp_path = path.with_extension("pem.tmp");
        let pem = encode_certificate_pem(certificate.as_ref());

        fs::write(&tmp_path, pem).map_err(TrustError::storage(&tmp_path))?;
        if let Err(e) = fs::rename(&tmp_path, &path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(TrustError::storage(&path)(e));
        }

        let record = TrustRecord::new(identity.clone(), certificate);
        info!("📌 Pinned {} ({})", identity, record.fingerprint);
        Ok(record)
    }

    /// Stored fingerprint, without contacting the server
    pub fn saved_fingerprint(&self, identity: &ServerIdentity) -> Option<String> {
        match self.lookup(identity) {
            Ok(record) => record.map(|r| r.fingerprint),
            Err(e) => {
                warn!("Failed to read trust record for {}: {}", identity, e);
                None
            }
        }
    }

    /// Delete the record for an identity. Returns whether one existed.
    pub fn remove(&self, identity: &ServerIdentity) -> Result<bool, TrustError> {
        let path = self.record_path(identity);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("🗑️  Removed trust record for {}", identity);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(TrustError::storage(&path)(e)),
        }
    }
}
