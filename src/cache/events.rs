//! Events exchanged between the lock registry, the cache manager and the
//! transfer orchestrator.

use std::path::PathBuf;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cache::entry::ObjectId;

/// Lifecycle events routed by the cache manager.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    /// The acquirer won the transfer reservation for an uncached object.
    ObjectLocked {
        object_id: ObjectId,
        owner: String,
        session_id: String,
    },
    /// The last lock on an object was released.
    ObjectUnlocked { object_id: ObjectId },
    SessionCreated { session_id: Uuid },
    SessionDeleted { session_id: Uuid },
}

/// Fire-and-forget sender side of the event channel.
pub type EventSender = mpsc::UnboundedSender<CacheEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CacheEvent>;

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Send an event, ignoring a closed channel (the manager is shutting down).
pub fn emit(tx: &EventSender, event: CacheEvent) {
    if let Err(e) = tx.send(event) {
        tracing::debug!(event = ?e.0, "Event channel closed, dropping event");
    }
}

/// Published by the orchestrator once an object's bytes are in place.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferCompleted {
    pub object_id: ObjectId,
    pub ps_path: PathBuf,
}
