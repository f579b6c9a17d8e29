//! pinshare
//!
//! File sharing over self-signed TLS, with trust established the SSH way:
//! the first time a client meets a server it shows the certificate
//! fingerprint, the operator confirms it out of band, and the certificate is
//! pinned. Every later connection trusts that certificate and nothing else.
//!
//! ## Features
//! - Trust-on-first-use certificate pinning, one record per `host:port`
//! - Live trust checks: a server whose certificate changed is not trusted
//! - Multi-file uploads in one HTTPS request
//! - Concurrent, per-file isolated ingestion on the server
//! - Self-signed certificate generation
//!
//! ## Usage
//!
//! ```bash
//! # Start a server (generates key material on first run)
//! pinshare serve --port 8443 --upload-dir ./uploads
//!
//! # On the client: inspect, pin, upload
//! pinshare check --host files.example --port 8443
//! pinshare trust --host files.example --port 8443
//! pinshare upload --host files.example --port 8443 report.pdf notes.txt
//! ```

pub mod config;
pub mod fingerprint;
pub mod ingest;
pub mod server;
pub mod tls;
pub mod tofu;
pub mod transfer;
pub mod trust_store;

pub use config::Paths;
pub use fingerprint::fingerprint;
pub use ingest::{IncomingFile, IngestReport, Pipeline, UploadResult};
pub use server::{create_router, AppState, Server, ServerConfig};
pub use tls::ServerTlsConfig;
pub use tofu::{Confirm, TlsProbe, TrustStatus, TrustVerifier};
pub use transfer::{TransferClient, UploadReceipt};
pub use trust_store::{ServerIdentity, TrustError, TrustRecord, TrustStore};
