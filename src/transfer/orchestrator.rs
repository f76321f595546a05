//! Transfer orchestration: one task per transfer, outcomes folded back into
//! the cache entry and the transfer record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{remove_partial, Progress, ProgressSink, SourceDescriptor, TransferError, TransferJob};
use super::registry::HandlerRegistry;
use crate::cache::entries::CacheEntries;
use crate::cache::entry::ObjectId;
use crate::cache::events::TransferCompleted;
use crate::cache::path_mapper::PathMapper;
use crate::config::SettingsProvider;
use crate::metrics::Metrics;
use crate::store::models::{TransferQuery, TransferRecord, TransferStatus, TransferUpdate};
use crate::store::{MetadataStore, StoreResult};

/// Transfers that ended longer ago than this are hidden by
/// [`TransferOrchestrator::list_transfers`] when `discard_old` is set.
const RECENT_TRANSFER_WINDOW: time::Duration = time::Duration::minutes(1);

/// A launched transfer.
pub struct TransferHandle {
    pub transfer_id: Uuid,
    pub object_id: ObjectId,
    pub task: JoinHandle<()>,
}

/// Writes throttled progress into the transfer record.
struct RecordProgress {
    store: Arc<dyn MetadataStore>,
    transfer_id: Uuid,
}

#[async_trait]
impl ProgressSink for RecordProgress {
    async fn progress(&self, total: u64, transferred: u64) {
        let update = TransferUpdate {
            status: Some(TransferStatus::Transferring),
            size_bytes: Some(total),
            transferred_bytes: Some(transferred),
            ..Default::default()
        };
        if let Err(e) = self.store.update_transfer(self.transfer_id, &update).await {
            warn!(transfer_id = %self.transfer_id, error = %e, "Failed to record progress");
        }
    }
}

pub struct TransferOrchestrator {
    store: Arc<dyn MetadataStore>,
    entries: CacheEntries,
    handlers: Arc<HandlerRegistry>,
    settings: Arc<dyn SettingsProvider>,
    metrics: Arc<Metrics>,
    completed: broadcast::Sender<TransferCompleted>,
}

impl TransferOrchestrator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        handlers: Arc<HandlerRegistry>,
        settings: Arc<dyn SettingsProvider>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (completed, _) = broadcast::channel(256);
        Self {
            entries: CacheEntries::new(store.clone()),
            store,
            handlers,
            settings,
            metrics,
            completed,
        }
    }

    /// Subscribe to transfer-completed notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferCompleted> {
        self.completed.subscribe()
    }

    /// Launch the transfer of `object_id`. The caller must hold the entry's
    /// transfer reservation.
    pub async fn start_transfer(
        self: &Arc<Self>,
        owner: &str,
        object_id: &ObjectId,
        session_id: &str,
    ) -> StoreResult<TransferHandle> {
        let record = match self.store.upsert_transfer(object_id, owner, session_id).await {
            Ok(record) => record,
            Err(e) => {
                // Without a record nothing will ever finish the reservation.
                if let Err(e2) = self.entries.mark_transfer_failed(object_id, &e.to_string()).await {
                    error!(object_id = %object_id, error = %e2, "Failed to release transfer reservation");
                }
                return Err(e);
            }
        };

        self.metrics.transfers_started.inc();
        self.metrics.transfers_active.inc();
        info!(object_id = %object_id, transfer_id = %record.id, owner, "Starting transfer");

        let this = Arc::clone(self);
        let transfer_id = record.id;
        let id = object_id.clone();
        let task = tokio::spawn(async move {
            this.run(transfer_id, id).await;
        });

        Ok(TransferHandle {
            transfer_id,
            object_id: object_id.clone(),
            task,
        })
    }

    async fn run(&self, transfer_id: Uuid, object_id: ObjectId) {
        let destination = PathMapper::new(self.settings.settings().storage_root).path_for(&object_id);
        let mut managed = false;

        let outcome = self
            .execute(transfer_id, &object_id, &destination, &mut managed)
            .await;

        self.metrics.transfers_active.dec();
        match outcome {
            Ok(size) => self.succeed(transfer_id, &object_id, destination, size).await,
            Err(e) => {
                remove_partial(&destination).await;
                self.fail(transfer_id, &object_id, e, managed).await;
            }
        }
    }

    async fn execute(
        &self,
        transfer_id: Uuid,
        object_id: &ObjectId,
        destination: &Path,
        managed: &mut bool,
    ) -> Result<u64, TransferError> {
        self.update(transfer_id, TransferUpdate::status(TransferStatus::Initializing))
            .await;
        let object = self
            .store
            .get_object(object_id)
            .await
            .map_err(|e| TransferError::Transient(format!("store error: {e}")))?
            .ok_or_else(|| TransferError::Fatal(format!("object {object_id} is not in the catalog")))?;

        let source = SourceDescriptor::parse(&object.source);
        let handler = self.handlers.resolve(&source)?;
        *managed = handler.is_managed();

        let job = TransferJob {
            object_id: object_id.clone(),
            source,
            destination: destination.to_path_buf(),
            size_bytes: object.size_bytes,
            checksum: object.checksum,
            archive_member: object.archive_member,
        };
        self.update(
            transfer_id,
            TransferUpdate {
                status: Some(TransferStatus::Transferring),
                size_bytes: Some(job.size_bytes),
                transferred_bytes: Some(0),
                started_at: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        )
        .await;

        let mut progress = Progress::new(Arc::new(RecordProgress {
            store: self.store.clone(),
            transfer_id,
        }));
        debug!(object_id = %object_id, handler = handler.name(), "Handler selected");
        handler.transfer(&job, &mut progress).await?;
        Ok(job.size_bytes)
    }

    async fn succeed(&self, transfer_id: Uuid, object_id: &ObjectId, path: PathBuf, size: u64) {
        if let Err(e) = self.entries.mark_cached(object_id, path.clone()).await {
            error!(object_id = %object_id, error = %e, "Failed to mark entry cached");
            self.fail(transfer_id, object_id, TransferError::Transient(e.to_string()), false)
                .await;
            return;
        }
        match self.store.add_used_bytes(size.min(i64::MAX as u64) as i64).await {
            Ok(used) => self.metrics.used_bytes.set(used as i64),
            Err(e) => warn!(error = %e, "Failed to update used bytes"),
        }

        self.update(
            transfer_id,
            TransferUpdate {
                status: Some(TransferStatus::Done),
                transferred_bytes: Some(size),
                ended_at: Some(OffsetDateTime::now_utc()),
                ..Default::default()
            },
        )
        .await;
        self.metrics
            .transfers_finished
            .with_label_values(&[TransferStatus::Done.as_str()])
            .inc();
        self.metrics.bytes_transferred.inc_by(size);
        info!(object_id = %object_id, path = %path.display(), bytes = size, "Transfer completed");

        // No subscribers is fine.
        let _ = self.completed.send(TransferCompleted {
            object_id: object_id.clone(),
            ps_path: path,
        });
    }

    async fn fail(&self, transfer_id: Uuid, object_id: &ObjectId, err: TransferError, managed: bool) {
        let status = if err.is_fatal() || managed {
            TransferStatus::Failed
        } else {
            TransferStatus::FailedTemporarily
        };
        warn!(object_id = %object_id, status = %status, error = %err, "Transfer failed");

        self.update(
            transfer_id,
            TransferUpdate {
                status: Some(status),
                ended_at: Some(OffsetDateTime::now_utc()),
                error: Some(Some(err.to_string())),
                ..Default::default()
            },
        )
        .await;
        if let Err(e) = self.entries.mark_transfer_failed(object_id, &err.to_string()).await {
            error!(object_id = %object_id, error = %e, "Failed to record transfer failure");
        }
        self.metrics
            .transfers_finished
            .with_label_values(&[status.as_str()])
            .inc();
    }

    async fn update(&self, transfer_id: Uuid, update: TransferUpdate) {
        if let Err(e) = self.store.update_transfer(transfer_id, &update).await {
            warn!(transfer_id = %transfer_id, error = %e, "Failed to update transfer record");
        }
    }

    /// Relaunch transfers interrupted by a restart.
    ///
    /// Entries still flagged in flight are restarted on behalf of the owner
    /// recorded on the entry. Unfinished transfer records for other objects
    /// must win the reservation first, so recovery never runs two transfers
    /// for one object.
    pub async fn restart_interrupted(self: &Arc<Self>) -> StoreResult<Vec<TransferHandle>> {
        let mut handles = Vec::new();
        let mut seen = HashSet::new();

        for entry in self.entries.list_in_flight().await? {
            seen.insert(entry.object_id.clone());
            let Some(owner) = entry.transfer_owner else {
                warn!(object_id = %entry.object_id, "In-flight entry has no recorded owner");
                self.entries
                    .mark_transfer_failed(&entry.object_id, "interrupted transfer has no recorded owner")
                    .await?;
                continue;
            };
            info!(object_id = %entry.object_id, owner = %owner.owner, "Restarting transfer");
            handles.push(
                self.start_transfer(&owner.owner, &entry.object_id, &owner.session_id)
                    .await?,
            );
        }

        for transfer in self.store.list_unfinished_transfers().await? {
            if !seen.insert(transfer.object_id.clone()) {
                continue;
            }
            if self
                .entries
                .reserve_transfer(&transfer.object_id, &transfer.owner, &transfer.session_id)
                .await?
            {
                info!(object_id = %transfer.object_id, transfer_id = %transfer.id, "Restarting stale transfer");
                handles.push(
                    self.start_transfer(&transfer.owner, &transfer.object_id, &transfer.session_id)
                        .await?,
                );
                continue;
            }

            let cached = self
                .entries
                .get(&transfer.object_id)
                .await?
                .is_some_and(|e| e.cached);
            if cached {
                debug!(transfer_id = %transfer.id, "Closing stale transfer of cached object");
                self.update(
                    transfer.id,
                    TransferUpdate {
                        status: Some(TransferStatus::Done),
                        ended_at: Some(OffsetDateTime::now_utc()),
                        ..Default::default()
                    },
                )
                .await;
            }
        }

        Ok(handles)
    }

    /// Transfers of `owner`, optionally limited to a session. With
    /// `discard_old`, transfers that ended over a minute ago are hidden.
    pub async fn list_transfers(
        &self,
        owner: &str,
        session_id: Option<&str>,
        discard_old: bool,
    ) -> StoreResult<Vec<TransferRecord>> {
        let query = TransferQuery {
            owner: Some(owner.to_string()),
            session_id: session_id.map(str::to_string),
            ended_after: discard_old.then(|| OffsetDateTime::now_utc() - RECENT_TRANSFER_WINDOW),
        };
        self.store.list_transfers(&query).await
    }
}
