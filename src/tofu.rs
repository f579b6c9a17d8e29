//! Trust-On-First-Use Verification
//!
//! The first time a client meets a server it cannot verify the certificate
//! against any authority. Instead:
//!
//! ```text
//! Start ──already trusted──► AlreadyTrusted (store untouched)
//!   │
//!   ▼
//! Connecting ──unreachable / handshake failure──► Rejected
//!   │  (verification disabled, leaf certificate extracted)
//!   ▼
//! Presenting            fingerprint shown to the operator
//!   │
//!   ▼
//! AwaitingConfirmation ──anything but yes/y──► Rejected
//!   │
//!   ▼
//! Confirmed ──save──► End (record pinned)
//! ```
//!
//! Probing (`check`, `status`) never writes. Only `trust` and `retrust`
//! persist, and only after an explicit affirmative answer.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

use crate::fingerprint::{self, fingerprint};
use crate::tls::probe_client_config;
use crate::trust_store::{ServerIdentity, TrustError, TrustRecord, TrustStore};

/// Connect plus handshake budget for a probe
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of the certificate a server presents right now
#[async_trait]
pub trait CertificateProbe: Send + Sync {
    async fn presented_certificate(
        &self,
        identity: &ServerIdentity,
    ) -> Result<CertificateDer<'static>, TrustError>;
}

/// Probe over a real TLS connection with verification disabled
pub struct TlsProbe {
    config: Arc<ClientConfig>,
    connect_timeout: Duration,
}

impl TlsProbe {
    pub fn new() -> Result<Self, TrustError> {
        let config = probe_client_config().map_err(|e| TrustError::Tls(format!("{:#}", e)))?;
        Ok(Self {
            config,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl CertificateProbe for TlsProbe {
    async fn presented_certificate(
        &self,
        identity: &ServerIdentity,
    ) -> Result<CertificateDer<'static>, TrustError> {
        let server_name = ServerName::try_from(identity.host().to_owned())
            .map_err(|_| TrustError::InvalidServerName(identity.host().to_owned()))?;

        debug!("Probing {}", identity);

        let tcp_stream = match timeout(
            self.connect_timeout,
            TcpStream::connect((identity.host(), identity.port())),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TrustError::Unreachable {
                    identity: identity.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(TrustError::Unreachable {
                    identity: identity.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
                })
            }
        };

        let connector = TlsConnector::from(self.config.clone());
        let mut tls_stream =
            match timeout(self.connect_timeout, connector.connect(server_name, tcp_stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(TrustError::Handshake {
                        identity: identity.clone(),
                        source,
                    })
                }
                Err(_) => {
                    return Err(TrustError::Handshake {
                        identity: identity.clone(),
                        source: io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"),
                    })
                }
            };

        let (_, conn_info) = tls_stream.get_ref();
        let leaf = conn_info
            .peer_certificates()
            .and_then(|certs| certs.first())
            .cloned()
            .ok_or_else(|| TrustError::NoCertificate(identity.clone()))?;

        let _ = tls_stream.shutdown().await;

        Ok(leaf)
    }
}

/// Operator consent for pinning a fingerprint
pub trait Confirm: Send + Sync {
    fn confirm(&self, identity: &ServerIdentity, fingerprint: &str) -> bool;
}

impl<F> Confirm for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn confirm(&self, _identity: &ServerIdentity, fingerprint: &str) -> bool {
        self(fingerprint)
    }
}

/// Interactive confirmation on the controlling terminal.
///
/// Reading stdin blocks; inside a multi-threaded runtime the read runs under
/// `block_in_place` so other tasks keep their worker threads.
pub struct TerminalPrompt;

impl Confirm for TerminalPrompt {
    fn confirm(&self, identity: &ServerIdentity, fingerprint: &str) -> bool {
        println!("Server {} fingerprint: {}", identity, fingerprint);
        print!("Verify this matches the server's fingerprint, then confirm (yes/no): ");
        if io::stdout().flush().is_err() {
            return false;
        }

        blocking_io(|| read_answer(&mut io::stdin().lock()))
    }
}

/// Run blocking I/O without stalling a multi-threaded runtime
fn blocking_io<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            task::block_in_place(f)
        }
        _ => f(),
    }
}

fn read_answer(input: &mut dyn BufRead) -> bool {
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(_) => is_affirmative(&line),
        Err(e) => {
            warn!("Failed to read confirmation: {}", e);
            false
        }
    }
}

/// Scripted confirmation: accept only a fingerprint known in advance
pub struct ExpectedFingerprint(String);

impl ExpectedFingerprint {
    pub fn new(expected: &str) -> Self {
        Self(fingerprint::normalize(expected))
    }
}

impl Confirm for ExpectedFingerprint {
    fn confirm(&self, identity: &ServerIdentity, fingerprint: &str) -> bool {
        let accepted = !self.0.is_empty() && self.0 == fingerprint;
        if !accepted {
            warn!(
                "{} presented {} but {} was expected",
                identity, fingerprint, self.0
            );
        }
        accepted
    }
}

/// Explicit affirmative answers; everything else is a refusal
pub fn is_affirmative(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "yes" | "y")
}

/// Live trust state of an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustStatus {
    /// No record; the server currently presents `presented`
    Untrusted { presented: String },
    /// Record matches what the server presents
    Trusted { fingerprint: String },
    /// Record exists but the server now presents something else
    Changed { saved: String, presented: String },
}

/// Trust store plus a way to see what a server presents
pub struct TrustVerifier<P = TlsProbe> {
    store: TrustStore,
    probe: P,
}

impl<P: CertificateProbe> TrustVerifier<P> {
    pub fn new(store: TrustStore, probe: P) -> Self {
        Self { store, probe }
    }

    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    /// Reachability check: the fingerprint the server presents now
    pub async fn check(&self, identity: &ServerIdentity) -> Result<String, TrustError> {
        let certificate = self.probe.presented_certificate(identity).await?;
        Ok(fingerprint(certificate.as_ref()))
    }

    pub async fn status(&self, identity: &ServerIdentity) -> Result<TrustStatus, TrustError> {
        let saved = self.store.lookup(identity)?;
        let presented = self.check(identity).await?;

        Ok(match saved {
            None => TrustStatus::Untrusted { presented },
            Some(record) if record.fingerprint == presented => TrustStatus::Trusted {
                fingerprint: presented,
            },
            Some(record) => TrustStatus::Changed {
                saved: record.fingerprint,
                presented,
            },
        })
    }

    /// A record exists and matches the live certificate
    pub async fn is_trusted(&self, identity: &ServerIdentity) -> bool {
        match self.store.lookup(identity) {
            Ok(Some(_)) => {}
            Ok(None) => return false,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        }

        match self.status(identity).await {
            Ok(TrustStatus::Trusted { .. }) => true,
            Ok(_) => false,
            Err(e) => {
                debug!("Trust check for {} failed: {}", identity, e);
                false
            }
        }
    }

    /// Establish trust in an identity that is not trusted yet
    pub async fn trust(
        &self,
        identity: &ServerIdentity,
        confirm: &dyn Confirm,
    ) -> Result<TrustRecord, TrustError> {
        self.establish(identity, confirm, false).await
    }

    /// Establish trust even if a matching record exists, replacing it
    pub async fn retrust(
        &self,
        identity: &ServerIdentity,
        confirm: &dyn Confirm,
    ) -> Result<TrustRecord, TrustError> {
        self.establish(identity, confirm, true).await
    }

    async fn establish(
        &self,
        identity: &ServerIdentity,
        confirm: &dyn Confirm,
        replace: bool,
    ) -> Result<TrustRecord, TrustError> {
        let saved = self.store.lookup(identity)?;

        // Connecting
        let certificate = self.probe.presented_certificate(identity).await?;

        // Presenting
        let presented = fingerprint(certificate.as_ref());
        if let Some(record) = &saved {
            if record.fingerprint == presented && !replace {
                return Err(TrustError::AlreadyTrusted {
                    fingerprint: record.fingerprint.clone(),
                });
            }
            if record.fingerprint != presented {
                warn!(
                    "⚠️  Certificate of {} changed: pinned {}, presented {}",
                    identity, record.fingerprint, presented
                );
            }
        }

        // AwaitingConfirmation
        if !confirm.confirm(identity, &presented) {
            info!("Trust in {} not confirmed", identity);
            return Err(TrustError::NotConfirmed {
                fingerprint: presented,
            });
        }

        // Confirmed
        self.store.save(identity, certificate)
    }
}
