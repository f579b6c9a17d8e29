//! Pinned Transfer Client
//!
//! Uploads files to a server the operator has already pinned. The HTTPS
//! client built here trusts exactly one certificate, the one in the trust
//! record, and no system roots:
//!
//! ```text
//! Client                                    Server
//!   |                                          |
//!   |== probe: presented == pinned? ===========|  (live trust check)
//!   |                                          |
//!   |== TLS, verifier accepts pinned leaf only |
//!   |-- POST /upload (multipart: file, file..) |
//!   |<-------- 200 saved names | 500 failures -|
//! ```
//!
//! Trust establishment is a separate operation (see [`crate::tofu`]); an
//! untrusted server is an error here, never an implicit prompt.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use tracing::info;

use crate::server::UPLOAD_FIELD;
use crate::tls::pinned_client_config;
use crate::tofu::{CertificateProbe, TlsProbe, TrustStatus, TrustVerifier};
use crate::trust_store::{ServerIdentity, TrustError};

/// Whole-request budget for one upload
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Successful upload summary
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub files: usize,
    pub bytes: u64,
    /// Server response text, listing the saved names
    pub message: String,
}

/// Upload client bound to a trust store
pub struct TransferClient<P = TlsProbe> {
    verifier: TrustVerifier<P>,
    request_timeout: Duration,
    show_progress: bool,
}

impl<P: CertificateProbe> TransferClient<P> {
    pub fn new(verifier: TrustVerifier<P>) -> Self {
        Self {
            verifier,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            show_progress: false,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Show a spinner while the request is in flight
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn verifier(&self) -> &TrustVerifier<P> {
        &self.verifier
    }

    /// Send every file in one multipart request.
    ///
    /// Either the server saved all of them or this returns an error; a
    /// partial failure comes back as the server's enumeration of the files
    /// that failed.
    pub async fn upload(&self, identity: &ServerIdentity, paths: &[PathBuf]) -> Result<UploadReceipt> {
        if paths.is_empty() {
            bail!("No file paths provided");
        }

        let record = self
            .verifier
            .store()
            .lookup(identity)?
            .ok_or_else(|| TrustError::NotTrusted(identity.clone()))?;

        match self.verifier.status(identity).await? {
            TrustStatus::Trusted { .. } => {}
            TrustStatus::Untrusted { .. } => return Err(TrustError::NotTrusted(identity.clone()).into()),
            TrustStatus::Changed { saved, presented } => {
                return Err(TrustError::FingerprintMismatch {
                    identity: identity.clone(),
                    saved,
                    presented,
                }
                .into())
            }
        }

        let mut form = Form::new();
        let mut total_bytes: u64 = 0;
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| anyhow!("Not a file path: {:?}", path))?;
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read file {:?}", path))?;

            total_bytes += data.len() as u64;
            form = form.part(UPLOAD_FIELD, Part::bytes(data).file_name(file_name));
        }

        let tls_config = pinned_client_config(record.certificate)?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls_config)
            .timeout(self.request_timeout)
            .build()
            .context("Failed to build HTTPS client")?;

        let url = format!("https://{}/upload", identity);
        info!(
            "📤 Uploading {} file(s), {} to {}",
            paths.len(),
            format_size(total_bytes),
            identity
        );

        let spinner = self.show_progress.then(|| create_spinner(paths.len()));
        let sent = client.post(&url).multipart(form).send().await;
        if let Some(spinner) = &spinner {
            spinner.finish_and_clear();
        }

        let response = sent.with_context(|| format!("Request to {} failed", url))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status != StatusCode::OK {
            bail!("server returned {}: {}", status, body.trim());
        }

        info!("✅ {}", body.trim());
        Ok(UploadReceipt {
            files: paths.len(),
            bytes: total_bytes,
            message: body,
        })
    }
}

/// Spinner for an upload in flight
fn create_spinner(files: usize) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(format!("Uploading {} file(s)", files));
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Format file size for display
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} B", size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust_store::TrustStore;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(32 * 1024 * 1024), "32.00 MB");
    }

    #[tokio::test]
    async fn test_no_paths_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = TrustVerifier::new(TrustStore::new(dir.path()), TlsProbe::new().unwrap());
        let client = TransferClient::new(verifier);

        let err = client
            .upload(&ServerIdentity::new("127.0.0.1", 9), &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No file paths provided"));
    }

    #[tokio::test]
    async fn test_untrusted_server_is_refused_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, "a").unwrap();
        let verifier = TrustVerifier::new(
            TrustStore::new(dir.path().join("trusted")),
            TlsProbe::new().unwrap(),
        );
        let client = TransferClient::new(verifier);

        let err = client
            .upload(&ServerIdentity::new("127.0.0.1", 9), &[file])
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TrustError>(),
            Some(TrustError::NotTrusted(_))
        ));
    }
}
