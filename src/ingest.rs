//! Concurrent Ingestion Pipeline
//!
//! Persists every file of one upload request independently:
//!
//! ```text
//!            ┌──► worker 0 ──┐
//! files ─────┼──► worker 1 ──┼──► mpsc ──► coordinator ──► IngestReport
//!            └──► worker N ──┘   (index, UploadResult)
//! ```
//!
//! Workers share nothing but the result channel; each owns its destination
//! writer for its whole lifetime. The coordinator waits for exactly one
//! result per file, in any order, bounded by a deadline. A file whose worker
//! failed, vanished or missed the deadline is reported as a failure; its
//! siblings are unaffected and stay on disk.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use chrono::Local;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Timestamp prefix of saved filenames
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Default bound on waiting for all workers of one request
pub const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Numbered alternatives tried when a saved name is taken
const MAX_NAME_ATTEMPTS: usize = 1000;

/// Replacement for an original filename with no usable final component
const FALLBACK_NAME: &str = "upload";

/// Per-file failure
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("failed to create {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("no free name for {0} after {attempts} attempts", attempts = MAX_NAME_ATTEMPTS)]
    NameExhausted(String),

    #[error("not saved within {0:?}")]
    TimedOut(Duration),

    #[error("worker stopped without reporting")]
    WorkerLost,
}

/// One file part taken from a request
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub original_name: String,
    pub data: Bytes,
}

impl IncomingFile {
    pub fn new(original_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            original_name: original_name.into(),
            data: data.into(),
        }
    }
}

/// Outcome of one worker
#[derive(Debug)]
pub struct UploadResult {
    pub original_name: String,
    /// Name on disk, set only once the file is complete
    pub saved_name: Option<String>,
    pub bytes: u64,
    pub outcome: Result<(), UploadError>,
}

impl UploadResult {
    fn failed(original_name: String, error: UploadError) -> Self {
        Self {
            original_name,
            saved_name: None,
            bytes: 0,
            outcome: Err(error),
        }
    }
}

/// Aggregate of one request's results
#[derive(Debug, Default)]
pub struct IngestReport {
    pub results: Vec<UploadResult>,
}

impl IngestReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_ok())
    }

    /// Saved names of successful files
    pub fn saved_names(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.outcome.is_ok())
            .filter_map(|r| r.saved_name.clone())
            .collect()
    }

    /// `Failed to save <name>: <cause>` for every failed file
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                Ok(()) => None,
                Err(e) => Some(format!("Failed to save {}: {}", r.original_name, e)),
            })
            .collect()
    }
}

/// Destination for saved files
#[async_trait]
pub trait UploadStore: Send + Sync + 'static {
    /// Create a new file called `name`.
    ///
    /// Must fail with `AlreadyExists` rather than replace an existing file.
    async fn create(&self, name: &str) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Remove a file this store created that was never completed.
    ///
    /// A missing file is not an error.
    async fn discard(&self, name: &str) -> io::Result<()>;
}

/// Files directly inside one directory
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for a saved name, refusing anything that is not a plain
    /// filename directly inside the root
    pub fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(file)), None) if file == name && !name.contains('\\') => {
                Ok(self.root.join(file))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{:?} is not a plain file name", name),
            )),
        }
    }
}

#[async_trait]
impl UploadStore for DirectoryStore {
    async fn create(&self, name: &str) -> io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let path = self.resolve(name)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        Ok(Box::new(file))
    }

    async fn discard(&self, name: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.resolve(name)?).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Reduce an uploaded filename to a single safe path component.
///
/// Keeps the text after the last `/` or `\`, drops NUL characters, and
/// replaces empty, `.` and `..` results with a fixed name.
pub fn sanitize_filename(original: &str) -> String {
    let last = original.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| *c != '\0').collect();
    match cleaned.as_str() {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        _ => cleaned,
    }
}

/// `timestamp + sanitized name`, the first choice of saved name
pub fn saved_name(timestamp: &str, original: &str) -> String {
    format!("{}{}", timestamp, sanitize_filename(original))
}

/// The `n`th alternative: a `-n` suffix before the extension
fn numbered(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(dot) if dot > 0 => format!("{}-{}{}", &name[..dot], n, &name[dot..]),
        _ => format!("{}-{}", name, n),
    }
}

/// Runs one request's files through the store
pub struct Pipeline {
    store: Arc<dyn UploadStore>,
    collect_timeout: Duration,
}

impl Pipeline {
    pub fn new(store: Arc<dyn UploadStore>) -> Self {
        Self {
            store,
            collect_timeout: DEFAULT_COLLECT_TIMEOUT,
        }
    }

    pub fn with_collect_timeout(mut self, collect_timeout: Duration) -> Self {
        self.collect_timeout = collect_timeout;
        self
    }

    /// Save every file concurrently and collect exactly one result per file
    pub async fn ingest(&self, files: Vec<IncomingFile>) -> IngestReport {
        let total = files.len();
        if total == 0 {
            return IngestReport::default();
        }

        let deadline = Instant::now() + self.collect_timeout;
        let (tx, mut rx) = mpsc::channel::<(usize, UploadResult)>(total);
        let mut pending: Vec<Option<String>> = Vec::with_capacity(total);
        let mut workers = Vec::with_capacity(total);

        for (index, file) in files.into_iter().enumerate() {
            pending.push(Some(file.original_name.clone()));
            let tx = tx.clone();
            let store = Arc::clone(&self.store);
            workers.push(tokio::spawn(async move {
                let result = save_file(store, file).await;
                // The coordinator only stops listening after the deadline
                let _ = tx.send((index, result)).await;
            }));
        }
        // Only workers hold senders now, so recv() ends once all are gone
        drop(tx);

        let mut results = Vec::with_capacity(total);
        let mut timed_out = false;
        while results.len() < total {
            match timeout_at(deadline, rx.recv()).await {
                Ok(Some((index, result))) => {
                    if pending[index].take().is_some() {
                        results.push(result);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            }
        }

        for (index, name) in pending.into_iter().enumerate() {
            let Some(name) = name else { continue };
            let error = if timed_out {
                workers[index].abort();
                UploadError::TimedOut(self.collect_timeout)
            } else {
                UploadError::WorkerLost
            };
            error!("No result for {}: {}", name, error);
            results.push(UploadResult::failed(name, error));
        }

        debug!("Collected {} result(s) for {} file(s)", results.len(), total);
        IngestReport { results }
    }
}

/// A created destination that is removed again unless kept.
///
/// Dropping it armed (a worker aborted at the deadline) schedules the removal
/// on the runtime, since `Drop` cannot wait for it.
struct PartialFile {
    store: Arc<dyn UploadStore>,
    name: Option<String>,
}

impl PartialFile {
    fn new(store: Arc<dyn UploadStore>, name: String) -> Self {
        Self {
            store,
            name: Some(name),
        }
    }

    fn keep(mut self) {
        self.name = None;
    }

    async fn discard(mut self) {
        if let Some(name) = self.name.take() {
            discard(self.store.as_ref(), &name).await;
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        let Some(name) = self.name.take() else {
            return;
        };
        let store = Arc::clone(&self.store);
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { discard(store.as_ref(), &name).await });
            }
            Err(_) => warn!("Partial upload {} left behind: no runtime to remove it", name),
        }
    }
}

async fn discard(store: &dyn UploadStore, name: &str) {
    match store.discard(name).await {
        Ok(()) => debug!("Removed partial upload {}", name),
        Err(e) => error!("Failed to remove partial upload {}: {}", name, e),
    }
}

/// Worker body: pick a free name, copy the bytes, flush
async fn save_file(store: Arc<dyn UploadStore>, file: IncomingFile) -> UploadResult {
    let IncomingFile {
        original_name,
        data,
    } = file;

    let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
    let (name, mut writer) = match create_unique(store.as_ref(), &saved_name(&timestamp, &original_name)).await {
        Ok(created) => created,
        Err(e) => {
            warn!("Failed to receive file: {}, err: {}", original_name, e);
            return UploadResult::failed(original_name, e);
        }
    };
    let partial = PartialFile::new(Arc::clone(&store), name.clone());

    let mut reader: &[u8] = &data;
    let copied = match tokio::io::copy(&mut reader, &mut writer).await {
        Ok(n) => writer.shutdown().await.map(|_| n),
        Err(e) => Err(e),
    };

    match copied {
        Ok(bytes) => {
            partial.keep();
            info!("📥 Received file: {} as {} ({} bytes)", original_name, name, bytes);
            UploadResult {
                original_name,
                saved_name: Some(name),
                bytes,
                outcome: Ok(()),
            }
        }
        Err(source) => {
            warn!("Failed to receive file: {}, err: {}", original_name, source);
            drop(writer);
            partial.discard().await;
            UploadResult::failed(original_name, UploadError::Write { name, source })
        }
    }
}

async fn create_unique(
    store: &dyn UploadStore,
    base: &str,
) -> Result<(String, Box<dyn AsyncWrite + Send + Unpin>), UploadError> {
    for attempt in 0..MAX_NAME_ATTEMPTS {
        let name = if attempt == 0 {
            base.to_string()
        } else {
            numbered(base, attempt)
        };
        match store.create(&name).await {
            Ok(writer) => return Ok((name, writer)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                debug!("{} exists, trying another name", name);
            }
            Err(source) => return Err(UploadError::Create { name, source }),
        }
    }
    Err(UploadError::NameExhausted(base.to_string()))
}
