//! HTTP(S) transfers.
//!
//! Whole objects are streamed with an async GET. Objects that live inside a
//! zip archive are extracted through [`HttpRangeReader`] on a blocking
//! thread so only the central directory and the member's bytes are fetched.
//! When the catalog declares a checksum, the written file is verified.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::handler::{
    ensure_parent, remove_partial, Progress, TransferError, TransferHandler, TransferJob,
};
use super::range_reader::HttpRangeReader;
use crate::config::{HttpAuth, HttpConfig};

const CHECKSUM_CHUNK: usize = 64 * 1024;

fn classify(e: reqwest::Error) -> TransferError {
    if e.is_connect() || e.is_timeout() {
        TransferError::Transient(format!("HTTP error: {e}"))
    } else {
        TransferError::Fatal(format!("HTTP error: {e}"))
    }
}

pub struct HttpHandler {
    client: Client,
    connect_timeout: Duration,
    timeout: Option<Duration>,
    auth: Vec<HttpAuth>,
}

impl HttpHandler {
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let timeout = (config.timeout_secs > 0).then(|| Duration::from_secs(config.timeout_secs));

        let mut builder = Client::builder().connect_timeout(connect_timeout);
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        Ok(Self {
            client: builder.build()?,
            connect_timeout,
            timeout,
            auth: config.auth.clone(),
        })
    }

    /// Configured headers for the host of `url`.
    fn headers_for(&self, url: &str) -> Result<HeaderMap, TransferError> {
        let parsed = url::Url::parse(url)
            .map_err(|e| TransferError::Fatal(format!("invalid URL {url:?}: {e}")))?;
        let host = parsed.host_str().unwrap_or_default();

        let mut headers = HeaderMap::new();
        for auth in self.auth.iter().filter(|a| a.host.eq_ignore_ascii_case(host)) {
            let name = HeaderName::from_bytes(auth.header.as_bytes())
                .map_err(|e| TransferError::Fatal(format!("invalid auth header name: {e}")))?;
            let value = HeaderValue::from_str(&auth.value)
                .map_err(|e| TransferError::Fatal(format!("invalid auth header value: {e}")))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }

    async fn stream_to_file(&self, job: &TransferJob, progress: &mut Progress) -> Result<u64, TransferError> {
        let headers = self.headers_for(&job.source.url)?;
        let response = self
            .client
            .get(&job.source.url)
            .headers(headers)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Fatal(format!(
                "GET {} returned {status}",
                job.source.url
            )));
        }

        ensure_parent(&job.destination).await?;
        let mut output = File::create(&job.destination).await?;
        progress.start(job.size_bytes).await;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(classify)?;
            output.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.update(job.size_bytes, written).await;
        }
        output.flush().await?;
        output.sync_all().await?;
        Ok(written)
    }

    async fn extract_member(&self, job: &TransferJob, member: &str, progress: &mut Progress) -> Result<u64, TransferError> {
        let headers = self.headers_for(&job.source.url)?;
        ensure_parent(&job.destination).await?;
        progress.start(job.size_bytes).await;

        let url = job.source.url.clone();
        let member = member.to_string();
        let destination = job.destination.clone();
        let connect_timeout = self.connect_timeout;
        let timeout = self.timeout;

        // The blocking client is created and dropped on the blocking thread.
        let written = tokio::task::spawn_blocking(move || -> Result<u64, TransferError> {
            let mut builder = reqwest::blocking::Client::builder().connect_timeout(connect_timeout);
            builder = builder.timeout(timeout);
            let client = builder.build().map_err(classify)?;

            let reader = HttpRangeReader::open(client, &url, headers)?;
            let mut archive = zip::ZipArchive::new(reader)
                .map_err(|e| zip_error(e, &url))?;
            let mut entry = archive
                .by_name(&member)
                .map_err(|e| zip_error(e, &url))?;
            let mut output = std::fs::File::create(&destination)?;
            let written = std::io::copy(&mut entry, &mut output)?;
            output.sync_all()?;
            Ok(written)
        })
        .await
        .map_err(|e| TransferError::Fatal(format!("extraction task failed: {e}")))??;

        progress.finish(job.size_bytes, written).await;
        Ok(written)
    }
}

fn zip_error(e: zip::result::ZipError, url: &str) -> TransferError {
    match e {
        zip::result::ZipError::Io(io) => TransferError::from(io),
        zip::result::ZipError::FileNotFound => {
            TransferError::Fatal(format!("member not found in archive {url}"))
        }
        other => TransferError::Fatal(format!("invalid archive {url}: {other}")),
    }
}

/// SHA-256 of a file, read in 64 KiB chunks.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHECKSUM_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn verify_checksum(path: &Path, expected: &str) -> Result<(), TransferError> {
    let Some(expected_hex) = expected.strip_prefix("sha256:") else {
        return Err(TransferError::Fatal(format!(
            "unsupported checksum format {expected:?}"
        )));
    };
    let expected_hex = expected_hex.to_ascii_lowercase();
    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|e| TransferError::Fatal(format!("checksum task failed: {e}")))??;

    if actual != expected_hex {
        warn!(path = %path.display(), expected = %expected_hex, actual = %actual, "Checksum mismatch");
        return Err(TransferError::Fatal("checksum verification failed".to_string()));
    }
    Ok(())
}

#[async_trait]
impl TransferHandler for HttpHandler {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn transfer(&self, job: &TransferJob, progress: &mut Progress) -> Result<(), TransferError> {
        let written = match job.archive_member.as_deref() {
            Some(member) => self.extract_member(job, member, progress).await?,
            None => self.stream_to_file(job, progress).await?,
        };

        if let Some(ref expected) = job.checksum {
            if let Err(e) = verify_checksum(&job.destination, expected).await {
                remove_partial(&job.destination).await;
                return Err(e);
            }
        }

        debug!(
            object_id = %job.object_id,
            url = %job.source.url,
            bytes = written,
            "Fetched object over HTTP"
        );
        Ok(())
    }
}
