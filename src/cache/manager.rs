//! Cache manager: a thin router from cache events to the components that act
//! on them.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::cache::events::{CacheEvent, EventReceiver};
use crate::cache::gc::GarbageCollector;
use crate::transfer::orchestrator::TransferOrchestrator;

pub struct CacheManager {
    orchestrator: Arc<TransferOrchestrator>,
    gc: Arc<GarbageCollector>,
}

impl CacheManager {
    pub fn new(orchestrator: Arc<TransferOrchestrator>, gc: Arc<GarbageCollector>) -> Self {
        Self { orchestrator, gc }
    }

    pub async fn handle(&self, event: CacheEvent) {
        match event {
            CacheEvent::ObjectLocked {
                object_id,
                owner,
                session_id,
            } => {
                if let Err(e) = self
                    .orchestrator
                    .start_transfer(&owner, &object_id, &session_id)
                    .await
                {
                    error!(object_id = %object_id, error = %e, "Could not start transfer");
                }
            }
            CacheEvent::ObjectUnlocked { object_id } => self.gc.unreachable(&object_id),
            CacheEvent::SessionCreated { session_id } => {
                debug!(session_id = %session_id, "Session created")
            }
            CacheEvent::SessionDeleted { session_id } => {
                debug!(session_id = %session_id, "Session deleted")
            }
        }
    }

    /// Route events until every sender is dropped.
    pub fn spawn(self, mut events: EventReceiver) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event).await;
            }
            debug!("Event channel closed, cache manager stopping");
        })
    }
}
