//! Transfers delegated to an external managed transfer service.
//!
//! The service copies the object into its drop directory under a temporary
//! name and owns retries and backoff. This handler submits the task, polls it
//! until it is terminal, then moves the materialized file into the cache.
//! Every failure reported here is terminal.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::handler::{ensure_parent, Progress, TransferError, TransferHandler, TransferJob};
use crate::config::ManagedConfig;

/// What to ask the managed service for.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagedRequest {
    /// Endpoint (URL authority) of the source.
    pub source_endpoint: String,
    pub source_path: String,
    /// File name to materialize inside the drop directory.
    pub destination_name: String,
    pub label: String,
}

/// State of a task as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedTaskState {
    Active { bytes_transferred: u64 },
    /// The service cannot make progress, typically an expired credential.
    Inactive,
    Succeeded,
    Failed { reason: Option<String> },
    Unknown(String),
}

#[async_trait]
pub trait ManagedTransferService: Send + Sync {
    /// Submit a task and return its id.
    async fn submit(&self, request: &ManagedRequest) -> Result<String, TransferError>;

    async fn status(&self, task_id: &str) -> Result<ManagedTaskState, TransferError>;
}

pub struct ManagedHandler {
    service: Arc<dyn ManagedTransferService>,
    drop_dir: PathBuf,
    poll_interval: Duration,
}

impl ManagedHandler {
    pub fn new(
        service: Arc<dyn ManagedTransferService>,
        drop_dir: impl Into<PathBuf>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            service,
            drop_dir: drop_dir.into(),
            poll_interval,
        }
    }

    pub fn from_config(config: &ManagedConfig) -> Result<Self, reqwest::Error> {
        let service = RestTransferService::new(&config.endpoint, config.token.clone())?;
        Ok(Self::new(
            Arc::new(service),
            &config.drop_dir,
            Duration::from_secs(config.poll_interval_secs),
        ))
    }

    fn request_for(job: &TransferJob, destination_name: &str) -> Result<ManagedRequest, TransferError> {
        let url = url::Url::parse(&job.source.url).map_err(|e| {
            TransferError::Fatal(format!("invalid source URL {:?}: {e}", job.source.url))
        })?;
        Ok(ManagedRequest {
            source_endpoint: url.host_str().unwrap_or_default().to_string(),
            source_path: url.path().to_string(),
            destination_name: destination_name.to_string(),
            label: job.object_id.to_string(),
        })
    }
}

/// Move `from` to `to`, falling back to copy-and-delete across filesystems.
async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

#[async_trait]
impl TransferHandler for ManagedHandler {
    fn name(&self) -> &'static str {
        "managed"
    }

    fn is_managed(&self) -> bool {
        true
    }

    async fn transfer(&self, job: &TransferJob, progress: &mut Progress) -> Result<(), TransferError> {
        let tmp_name = Uuid::new_v4().to_string();
        let request = Self::request_for(job, &tmp_name)?;
        let task_id = self.service.submit(&request).await?;
        info!(object_id = %job.object_id, task_id = %task_id, "Submitted managed transfer");
        progress.start(job.size_bytes).await;

        loop {
            match self.service.status(&task_id).await? {
                ManagedTaskState::Active { bytes_transferred } => {
                    progress.update(job.size_bytes, bytes_transferred).await;
                }
                ManagedTaskState::Inactive => {
                    let msg = format!("credential expired for managed task {task_id}");
                    warn!(object_id = %job.object_id, "{msg}");
                    return Err(TransferError::Fatal(msg));
                }
                ManagedTaskState::Succeeded => {
                    ensure_parent(&job.destination).await.map_err(|e| {
                        TransferError::Fatal(format!("could not create destination directory: {e}"))
                    })?;
                    move_file(&self.drop_dir.join(&tmp_name), &job.destination).await?;
                    progress.finish(job.size_bytes, job.size_bytes).await;
                    debug!(object_id = %job.object_id, task_id = %task_id, "Managed transfer done");
                    return Ok(());
                }
                ManagedTaskState::Failed { reason } => {
                    return Err(TransferError::Fatal(match reason {
                        Some(r) => format!("managed task {task_id} failed: {r}"),
                        None => format!("managed task {task_id} failed for unknown reasons"),
                    }));
                }
                ManagedTaskState::Unknown(status) => {
                    return Err(TransferError::Fatal(format!(
                        "unknown status {status:?} for managed task {task_id}"
                    )));
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    status: String,
    #[serde(default)]
    bytes_transferred: u64,
    #[serde(default)]
    reason: Option<String>,
}

/// JSON-over-HTTP client: `POST {endpoint}/tasks`, `GET {endpoint}/tasks/{id}`.
pub struct RestTransferService {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl RestTransferService {
    pub fn new(endpoint: &str, token: Option<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }
}

// The service owns retries, so even connection errors are final here.
fn service_error(e: reqwest::Error) -> TransferError {
    TransferError::Fatal(format!("managed service error: {e}"))
}

#[async_trait]
impl ManagedTransferService for RestTransferService {
    async fn submit(&self, request: &ManagedRequest) -> Result<String, TransferError> {
        let response = self
            .authorize(self.client.post(format!("{}/tasks", self.endpoint)))
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(service_error)?;
        let body: SubmitResponse = response.json().await.map_err(service_error)?;
        Ok(body.task_id)
    }

    async fn status(&self, task_id: &str) -> Result<ManagedTaskState, TransferError> {
        let response = self
            .authorize(self.client.get(format!("{}/tasks/{task_id}", self.endpoint)))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(service_error)?;
        let body: StatusResponse = response.json().await.map_err(service_error)?;
        Ok(match body.status.to_ascii_lowercase().as_str() {
            "active" => ManagedTaskState::Active {
                bytes_transferred: body.bytes_transferred,
            },
            "inactive" => ManagedTaskState::Inactive,
            "succeeded" => ManagedTaskState::Succeeded,
            "failed" => ManagedTaskState::Failed {
                reason: body.reason,
            },
            _ => ManagedTaskState::Unknown(body.status),
        })
    }
}
