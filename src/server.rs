//! File Sharing Server
//!
//! Accepts HTTPS uploads over the server's self-signed certificate:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    TLS Server                           │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │         TCP accept loop + TLS acceptor (rustls)     ││
//! │  │  - Connection limit (semaphore)                     ││
//! │  │  - One task per connection                          ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                         │                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │         HTTP (hyper-util auto, axum router)         ││
//! │  │  - POST /upload, multipart, 32 MiB limit            ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                         │                               │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │         Ingestion pipeline                          ││
//! │  │  - One worker per file                              ││
//! │  │  - Timestamped, sanitized names                     ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use thiserror::Error;
use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::ingest::{DirectoryStore, IncomingFile, Pipeline, DEFAULT_COLLECT_TIMEOUT};
use crate::tls::ServerTlsConfig;

/// Maximum concurrent connections
const MAX_CONNECTIONS: usize = 100;

/// Maximum size of one upload request, all files together (32 MiB)
pub const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

/// Multipart field carrying files
pub const UPLOAD_FIELD: &str = "file";

/// Field consulted when no part uses [`UPLOAD_FIELD`]
pub const FALLBACK_UPLOAD_FIELD: &str = "files";

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory uploaded files are saved in
    pub upload_dir: PathBuf,
    /// TLS configuration
    pub tls_config: ServerTlsConfig,
    /// Bound on waiting for one request's workers
    pub collect_timeout: Duration,
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr, upload_dir: PathBuf, tls_config: ServerTlsConfig) -> Self {
        Self {
            bind_addr,
            upload_dir,
            tls_config,
            collect_timeout: DEFAULT_COLLECT_TIMEOUT,
        }
    }
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
        }
    }
}

/// Upload request errors, rendered as plain-text responses
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Failed to parse form: {0}")]
    Multipart(#[from] MultipartError),

    #[error("No files found in upload")]
    NoFiles,

    #[error("Errors occurred: {}", format_list(.0))]
    Failed(Vec<String>),
}

impl IngestError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Multipart(e) => e.status(),
            Self::NoFiles => StatusCode::BAD_REQUEST,
            Self::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Upload failed: {}", self);
        } else {
            warn!("Upload rejected ({}): {}", status, self);
        }
        (status, self.to_string()).into_response()
    }
}

/// `[a, b, c]`
fn format_list(items: &[String]) -> String {
    format!("[{}]", items.join(", "))
}

/// Create the application router
///
/// # Routes
/// - `POST /upload` - multipart upload, at most [`MAX_UPLOAD_BYTES`] per request
/// - any other method on `/upload` - `405` with `Allow: POST`
/// - anything else - a plain-text greeting
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload_files).fallback(method_not_allowed))
        .fallback(hello)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// `POST /upload`: save every file part concurrently
///
/// Parts are buffered in memory under the body limit, then handed to the
/// ingestion pipeline as a batch.
///
/// # Responses
/// - `200` - `Files uploaded successfully: [names]`
/// - `400` - no file parts, or an unparsable body
/// - `413` - body over [`MAX_UPLOAD_BYTES`]
/// - `500` - `Errors occurred: [...]`, one entry per failed file; the
///   other files stay saved
pub async fn upload_files(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<String, IngestError> {
    let mut primary = Vec::new();
    let mut fallback = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let target = match field.name() {
            Some(UPLOAD_FIELD) => &mut primary,
            Some(FALLBACK_UPLOAD_FIELD) => &mut fallback,
            _ => continue,
        };
        // Parts without a filename are plain form values
        let Some(file_name) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let data = field.bytes().await?;
        target.push(IncomingFile::new(file_name, data));
    }

    let files = if primary.is_empty() { fallback } else { primary };
    if files.is_empty() {
        return Err(IngestError::NoFiles);
    }

    info!("📤 Receiving {} file(s)", files.len());
    let report = state.pipeline.ingest(files).await;

    if report.is_success() {
        let saved = report.saved_names();
        info!("✅ Saved {} file(s)", saved.len());
        Ok(format!("Files uploaded successfully: {}", format_list(&saved)))
    } else {
        Err(IngestError::Failed(report.failures()))
    }
}

async fn method_not_allowed() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        "Method not allowed",
    )
}

async fn hello(uri: Uri) -> String {
    format!("Hello, {}!", uri.path().trim_start_matches('/'))
}

/// File sharing server
pub struct Server {
    config: ServerConfig,
    connection_semaphore: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Bind the configured address and serve until the process ends
    ///
    /// # Errors
    /// Fails if the address cannot be bound or the upload directory cannot
    /// be created. Per-connection failures are logged and never end the loop.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    ///
    /// # Security Notes
    /// - At most `MAX_CONNECTIONS` connections are served at once; extra
    ///   connections are dropped before the TLS handshake
    /// - The upload directory is created owner-only (0700) on Unix
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.setup_upload_directory().await?;

        let local_addr = listener.local_addr().context("Listener has no address")?;
        info!("🔒 File sharing server listening on {}", local_addr);
        info!("📁 Upload directory: {:?}", self.config.upload_dir);

        let pipeline = Pipeline::new(Arc::new(DirectoryStore::new(&self.config.upload_dir)))
            .with_collect_timeout(self.config.collect_timeout);
        let router = create_router(AppState::new(pipeline));
        let tls_acceptor = TlsAcceptor::from(self.config.tls_config.config.clone());

        loop {
            let (tcp_stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, rejecting {}", peer_addr);
                    continue;
                }
            };

            let tls_acceptor = tls_acceptor.clone();
            let router = router.clone();

            tokio::spawn(async move {
                let _permit = permit;

                match Self::handle_connection(tcp_stream, tls_acceptor, peer_addr, router).await {
                    Ok(()) => debug!("Connection from {} closed normally", peer_addr),
                    Err(e) => warn!("Connection from {} error: {:#}", peer_addr, e),
                }
            });
        }
    }

    /// Create the upload directory, owner-only on Unix
    async fn setup_upload_directory(&self) -> Result<()> {
        let dir = &self.config.upload_dir;
        if !dir.exists() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create upload directory: {:?}", dir))?;
            info!("Created upload directory: {:?}", dir);

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut permissions = fs::metadata(dir).await?.permissions();
                permissions.set_mode(0o700);
                fs::set_permissions(dir, permissions).await?;
            }
        }

        Ok(())
    }

    /// TLS handshake, then HTTP/1 or HTTP/2 until the client is done
    async fn handle_connection(
        tcp_stream: TcpStream,
        tls_acceptor: TlsAcceptor,
        peer_addr: SocketAddr,
        router: Router,
    ) -> Result<()> {
        debug!("📥 New connection from {}", peer_addr);

        let tls_stream = tls_acceptor
            .accept(tcp_stream)
            .await
            .context("TLS handshake failed")?;

        debug!("🔐 TLS handshake successful with {}", peer_addr);

        let service = service_fn(move |request: axum::http::Request<Incoming>| {
            router.clone().call(request)
        });

        auto::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(tls_stream), service)
            .await
            .map_err(|e| anyhow::anyhow!("HTTP error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_list() {
        assert_eq!(format_list(&[]), "[]");
        assert_eq!(
            format_list(&["a.txt".to_string(), "b.txt".to_string()]),
            "[a.txt, b.txt]"
        );
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(IngestError::NoFiles.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            IngestError::Failed(vec!["x".into()]).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            IngestError::Failed(vec!["Failed to save b.txt: boom".into()]).to_string(),
            "Errors occurred: [Failed to save b.txt: boom]"
        );
    }
}
