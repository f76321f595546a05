//! The contract every transfer handler implements.
//!
//! A handler moves the bytes of one object from its source to a destination
//! path inside the cache, creating parent directories as needed, and reports
//! progress through a throttled [`Progress`] reporter.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::cache::entry::ObjectId;

/// Progress is reported only when at least this many bytes moved...
pub const PROGRESS_MIN_BYTES: u64 = 1024 * 1024;
/// ...and at least this fraction of the total size.
pub const PROGRESS_MIN_FRACTION: f64 = 0.001;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Retrying cannot help (bad source, checksum mismatch, 4xx, ...).
    #[error("{0}")]
    Fatal(String),

    /// The failure may go away on its own (connection refused, timeout, ...).
    #[error("{0}")]
    Transient(String),
}

impl TransferError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransferError::Fatal(_))
    }
}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => TransferError::Transient(format!("I/O error: {e}")),
            _ => TransferError::Fatal(format!("I/O error: {e}")),
        }
    }
}

/// Where an object's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Scheme used to pick a handler; `local` when the source has no `://`.
    pub scheme: String,
    pub url: String,
}

impl SourceDescriptor {
    pub fn parse(source: &str) -> Self {
        let scheme = match source.find("://") {
            Some(ix) => source[..ix].to_ascii_lowercase(),
            None => "local".to_string(),
        };
        Self {
            scheme,
            url: source.to_string(),
        }
    }

    /// Filesystem path for `file://` URLs, `local://` URLs and bare paths.
    pub fn local_path(&self) -> Result<PathBuf, TransferError> {
        if !self.url.contains("://") {
            return Ok(PathBuf::from(&self.url));
        }
        if let Some(rest) = self.url.strip_prefix("local://") {
            return Ok(PathBuf::from(rest));
        }
        let url = url::Url::parse(&self.url)
            .map_err(|e| TransferError::Fatal(format!("invalid source URL {:?}: {e}", self.url)))?;
        url.to_file_path()
            .map_err(|_| TransferError::Fatal(format!("not a local file URL: {}", self.url)))
    }
}

/// Everything a handler needs to fetch one object.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub object_id: ObjectId,
    pub source: SourceDescriptor,
    pub destination: PathBuf,
    pub size_bytes: u64,
    /// Expected digest as `sha256:<hex>`.
    pub checksum: Option<String>,
    /// Extract only this member when the source is a zip archive.
    pub archive_member: Option<String>,
}

#[async_trait]
pub trait TransferHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Managed handlers delegate retries to an external service; their
    /// failures are always terminal.
    fn is_managed(&self) -> bool {
        false
    }

    async fn transfer(&self, job: &TransferJob, progress: &mut Progress) -> Result<(), TransferError>;
}

/// Receives (throttled) progress updates.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn progress(&self, total: u64, transferred: u64);
}

/// Throttles progress so a large transfer produces at most ~1000 updates and
/// never more than one per MiB.
pub struct Progress {
    sink: Arc<dyn ProgressSink>,
    last_reported: u64,
}

impl Progress {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            last_reported: 0,
        }
    }

    pub fn should_report(total: u64, last: u64, current: u64) -> bool {
        let delta = current.saturating_sub(last);
        delta >= PROGRESS_MIN_BYTES && delta as f64 >= total as f64 * PROGRESS_MIN_FRACTION
    }

    /// Unconditionally report the start of a transfer.
    pub async fn start(&mut self, total: u64) {
        self.last_reported = 0;
        self.sink.progress(total, 0).await;
    }

    pub async fn update(&mut self, total: u64, transferred: u64) {
        if Self::should_report(total, self.last_reported, transferred) {
            self.sink.progress(total, transferred).await;
            self.last_reported = transferred;
        }
    }

    /// Unconditionally report a final count.
    pub async fn finish(&mut self, total: u64, transferred: u64) {
        self.sink.progress(total, transferred).await;
        self.last_reported = transferred;
    }
}

/// Discards progress.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn progress(&self, _total: u64, _transferred: u64) {}
}

/// Create the parent directory of `path`.
pub async fn ensure_parent(path: &Path) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Best-effort removal of a partially written destination.
pub async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed partial file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<u64>>);

    #[async_trait]
    impl ProgressSink for Recorder {
        async fn progress(&self, _total: u64, transferred: u64) {
            self.0.lock().unwrap().push(transferred);
        }
    }

    #[test]
    fn test_source_scheme() {
        assert_eq!(SourceDescriptor::parse("/data/x.bin").scheme, "local");
        assert_eq!(SourceDescriptor::parse("file:///data/x.bin").scheme, "file");
        assert_eq!(SourceDescriptor::parse("HTTPS://host/x").scheme, "https");
        assert_eq!(SourceDescriptor::parse("globus://ep/x").scheme, "globus");
    }

    #[test]
    fn test_local_path() {
        let bare = SourceDescriptor::parse("/data/x.bin");
        assert_eq!(bare.local_path().unwrap(), PathBuf::from("/data/x.bin"));
        let file = SourceDescriptor::parse("file:///data/x.bin");
        assert_eq!(file.local_path().unwrap(), PathBuf::from("/data/x.bin"));
        let http = SourceDescriptor::parse("http://host/x");
        assert!(http.local_path().unwrap_err().is_fatal());
    }

    #[test]
    fn test_throttle_thresholds() {
        // Small object: the 1 MiB floor dominates.
        assert!(!Progress::should_report(10 * 1024 * 1024, 0, 1024 * 1024 - 1));
        assert!(Progress::should_report(10 * 1024 * 1024, 0, 1024 * 1024));

        // 10 GiB object: 0.1% is ~10.7 MB.
        let total = 10 * 1024 * 1024 * 1024;
        assert!(!Progress::should_report(total, 0, 2 * 1024 * 1024));
        assert!(Progress::should_report(total, 0, total / 1000 + 1));
    }

    #[tokio::test]
    async fn test_progress_reports_are_throttled() {
        let recorder = Arc::new(Recorder::default());
        let mut progress = Progress::new(recorder.clone());
        let total = 4 * 1024 * 1024;

        progress.start(total).await;
        for step in 1..=64u64 {
            progress.update(total, step * 64 * 1024).await;
        }

        let seen = recorder.0.lock().unwrap().clone();
        assert_eq!(seen, vec![0, 1024 * 1024, 2 * 1024 * 1024, 3 * 1024 * 1024, 4 * 1024 * 1024]);
    }

    #[test]
    fn test_io_error_classification() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(!TransferError::from(refused).is_fatal());
        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(TransferError::from(missing).is_fatal());
    }
}
