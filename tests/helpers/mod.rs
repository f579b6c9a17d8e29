#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum_test::TestServer;
use pinshare::ingest::{DirectoryStore, UploadStore};
use pinshare::server::{create_router, AppState, Server, ServerConfig};
use pinshare::tls::{generate_server_cert, GeneratedCert, ServerTlsConfig};
use pinshare::{fingerprint, Pipeline, ServerIdentity};
use rustls::pki_types::CertificateDer;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Router over an in-process test client, saving into `upload_dir`
pub fn test_app(upload_dir: &Path) -> TestServer {
    test_app_with_store(Arc::new(DirectoryStore::new(upload_dir)))
}

pub fn test_app_with_store(store: Arc<dyn UploadStore>) -> TestServer {
    let router = create_router(AppState::new(Pipeline::new(store)));
    TestServer::new(router).unwrap()
}

/// Names of the files directly inside `dir`, sorted
pub fn saved_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// A real TLS server on an ephemeral localhost port
pub struct RunningServer {
    pub identity: ServerIdentity,
    pub certificate: CertificateDer<'static>,
    pub fingerprint: String,
    pub upload_dir: PathBuf,
    _dir: TempDir,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn start_server() -> RunningServer {
    let dir = tempfile::tempdir().unwrap();
    let upload_dir = dir.path().join("uploads");

    let GeneratedCert {
        cert_pem,
        key_pem,
        cert_der,
    } = generate_server_cert().unwrap();
    let tls_config = ServerTlsConfig::from_pem(&cert_pem, &key_pem).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Server::new(ServerConfig::new(addr, upload_dir.clone(), tls_config));
    let handle = tokio::spawn(async move { server.serve(listener).await });

    RunningServer {
        identity: ServerIdentity::new("127.0.0.1", addr.port()),
        fingerprint: fingerprint(cert_der.as_ref()),
        certificate: cert_der,
        upload_dir,
        _dir: dir,
        handle,
    }
}
