//! Copies objects from the local filesystem (bare paths and `file://` URLs).

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::handler::{ensure_parent, Progress, TransferError, TransferHandler, TransferJob};

const BUF_SIZE: usize = 32 * 1024;

#[derive(Debug, Default)]
pub struct LocalHandler;

impl LocalHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransferHandler for LocalHandler {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn transfer(&self, job: &TransferJob, progress: &mut Progress) -> Result<(), TransferError> {
        let source = job.source.local_path()?;
        let mut input = File::open(&source).await.map_err(|e| {
            TransferError::Fatal(format!("cannot open {}: {e}", source.display()))
        })?;

        ensure_parent(&job.destination).await?;
        let mut output = File::create(&job.destination).await?;
        progress.start(job.size_bytes).await;

        let mut buf = vec![0u8; BUF_SIZE];
        let mut copied = 0u64;
        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            output.write_all(&buf[..n]).await?;
            copied += n as u64;
            progress.update(job.size_bytes, copied).await;
        }
        output.flush().await?;
        output.sync_all().await?;

        debug!(
            object_id = %job.object_id,
            source = %source.display(),
            destination = %job.destination.display(),
            bytes = copied,
            "Copied local object"
        );
        Ok(())
    }
}
