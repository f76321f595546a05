//! Lock registry: pins objects in the cache on behalf of callers.
//!
//! A lock is a record plus one unit of the entry's `lock_count`. The first
//! acquirer of an uncached object also wins the transfer reservation and
//! announces it with [`CacheEvent::ObjectLocked`]; everyone else polls the
//! entry until it is cached.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::entries::CacheEntries;
use crate::cache::entry::{CacheEntry, ObjectId};
use crate::cache::events::{emit, CacheEvent, EventSender};
use crate::metrics::Metrics;
use crate::store::models::LockRecord;
use crate::store::{MetadataStore, StoreError};

#[derive(Error, Debug)]
pub enum LockError {
    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("session {0} belongs to another owner")]
    NotSessionOwner(Uuid),

    #[error("object {0} is not part of the session dataset")]
    NotInDataset(ObjectId),

    #[error("object {0} is not in the catalog")]
    UnknownObject(ObjectId),

    #[error("lock {0} not found")]
    LockNotFound(Uuid),

    #[error("lock {0} belongs to another owner")]
    NotLockOwner(Uuid),

    #[error("object {0} is not cached yet")]
    NotCached(ObjectId),

    #[error("transfer of object {object_id} failed: {reason}")]
    TransferFailed { object_id: ObjectId, reason: String },

    #[error("timed out waiting for object {0}")]
    Timeout(ObjectId),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub struct LockRegistry {
    entries: CacheEntries,
    store: Arc<dyn MetadataStore>,
    events: EventSender,
    metrics: Arc<Metrics>,

    /// Sleep between attempts while a deletion holds the entry.
    delete_poll: Duration,

    /// Poll interval of [`wait_until_cached`](Self::wait_until_cached).
    cached_poll: Duration,
}

impl LockRegistry {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        events: EventSender,
        metrics: Arc<Metrics>,
        delete_poll: Duration,
        cached_poll: Duration,
    ) -> Self {
        Self {
            entries: CacheEntries::new(store.clone()),
            store,
            events,
            metrics,
            delete_poll,
            cached_poll,
        }
    }

    /// Pin `object_id` for `owner` within the given session.
    ///
    /// Returns as soon as the lock is counted; the bytes may still be in
    /// flight. Use [`wait_until_cached`](Self::wait_until_cached) or
    /// [`cached_path`](Self::cached_path) to reach them.
    pub async fn acquire(
        &self,
        object_id: &ObjectId,
        owner: &str,
        session_id: Uuid,
    ) -> Result<LockRecord, LockError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(LockError::SessionNotFound(session_id))?;
        if session.owner != owner {
            return Err(LockError::NotSessionOwner(session_id));
        }
        if !session.contains(object_id) {
            return Err(LockError::NotInDataset(object_id.clone()));
        }

        let object = self
            .store
            .get_object(object_id)
            .await?
            .ok_or_else(|| LockError::UnknownObject(object_id.clone()))?;
        self.entries.ensure(object_id, object.size_bytes).await?;

        // A deletion in progress always finishes in bounded time, so wait it
        // out rather than failing the caller.
        let mut attempts = 0u32;
        while !self.entries.increment_lock(object_id).await? {
            attempts += 1;
            sleep(self.delete_poll).await;
        }
        if attempts > 0 {
            debug!(object_id = %object_id, attempts, "Waited for pending delete");
        }

        // The count is taken before the record exists; until the record is
        // saved, dropping this future must give the count back.
        let pin = PinGuard::new(&self.entries, object_id);
        let session_key = session_id.to_string();
        let lock = LockRecord::new(owner, &session_key, object_id.clone());
        self.store.insert_lock(&lock).await?;
        pin.disarm();
        self.metrics.locks_held.inc();

        if self
            .entries
            .reserve_transfer(object_id, owner, &session_key)
            .await?
        {
            info!(object_id = %object_id, owner, "Object locked, transfer reserved");
            emit(
                &self.events,
                CacheEvent::ObjectLocked {
                    object_id: object_id.clone(),
                    owner: owner.to_string(),
                    session_id: session_key,
                },
            );
        }

        Ok(lock)
    }

    /// Release a lock previously returned by [`acquire`](Self::acquire).
    pub async fn release(&self, lock_id: Uuid, owner: &str) -> Result<(), LockError> {
        let lock = self.get_lock(lock_id).await?;
        if lock.owner != owner {
            return Err(LockError::NotLockOwner(lock_id));
        }
        // A concurrent release of the same lock removes the record first.
        if self.store.remove_lock(lock_id).await?.is_none() {
            return Err(LockError::LockNotFound(lock_id));
        }

        match self.entries.decrement_lock(&lock.object_id).await? {
            Some(entry) => {
                self.metrics.locks_held.dec();
                if entry.lock_count == 0 {
                    debug!(object_id = %lock.object_id, "Object unlocked");
                    emit(
                        &self.events,
                        CacheEvent::ObjectUnlocked {
                            object_id: lock.object_id.clone(),
                        },
                    );
                }
            }
            // Forced clears reset the count without touching lock holders.
            None => debug!(object_id = %lock.object_id, "Lock count already zero"),
        }
        Ok(())
    }

    pub async fn get_lock(&self, lock_id: Uuid) -> Result<LockRecord, LockError> {
        self.store
            .get_lock(lock_id)
            .await?
            .ok_or(LockError::LockNotFound(lock_id))
    }

    pub async fn list_locks(
        &self,
        owner: &str,
        session_id: Option<&str>,
        object_id: Option<&ObjectId>,
    ) -> Result<Vec<LockRecord>, LockError> {
        Ok(self
            .store
            .list_locks(Some(owner), session_id, object_id)
            .await?)
    }

    async fn owned_lock(&self, lock_id: Uuid, owner: &str) -> Result<LockRecord, LockError> {
        let lock = self.get_lock(lock_id).await?;
        if lock.owner != owner {
            return Err(LockError::NotLockOwner(lock_id));
        }
        Ok(lock)
    }

    async fn entry_for(&self, object_id: &ObjectId) -> Result<CacheEntry, LockError> {
        self.entries
            .get(object_id)
            .await?
            .ok_or_else(|| LockError::UnknownObject(object_id.clone()))
    }

    /// Path of the cached bytes behind a lock, or [`LockError::NotCached`]
    /// while the transfer is still running.
    pub async fn cached_path(&self, lock_id: Uuid, owner: &str) -> Result<PathBuf, LockError> {
        let lock = self.owned_lock(lock_id, owner).await?;
        let entry = self.entry_for(&lock.object_id).await?;
        match (entry.cached, entry.ps_path) {
            (true, Some(path)) => Ok(path),
            _ => Err(LockError::NotCached(lock.object_id)),
        }
    }

    async fn poll_cached(&self, object_id: &ObjectId) -> Result<PathBuf, LockError> {
        loop {
            let entry = self.entry_for(object_id).await?;
            if let (true, Some(path)) = (entry.cached, entry.ps_path) {
                return Ok(path);
            }
            if !entry.transfer_in_progress {
                if let Some(reason) = entry.last_error {
                    return Err(LockError::TransferFailed {
                        object_id: object_id.clone(),
                        reason,
                    });
                }
            }
            sleep(self.cached_poll).await;
        }
    }

    /// Poll until the locked object is cached. Fails early when the entry
    /// records a failed transfer and nothing is retrying it.
    pub async fn wait_until_cached(
        &self,
        lock_id: Uuid,
        owner: &str,
        timeout: Duration,
    ) -> Result<PathBuf, LockError> {
        let lock = self.owned_lock(lock_id, owner).await?;
        let object_id = lock.object_id;

        match tokio::time::timeout(timeout, self.poll_cached(&object_id)).await {
            Ok(result) => result,
            Err(_) => Err(LockError::Timeout(object_id)),
        }
    }
}

/// Gives back one unit of `lock_count` unless disarmed.
struct PinGuard {
    entries: CacheEntries,
    object_id: ObjectId,
    armed: bool,
}

impl PinGuard {
    fn new(entries: &CacheEntries, object_id: &ObjectId) -> Self {
        Self {
            entries: entries.clone(),
            object_id: object_id.clone(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(object_id = %self.object_id, "No runtime to undo abandoned lock count");
            return;
        };
        let entries = self.entries.clone();
        let object_id = self.object_id.clone();
        handle.spawn(async move {
            match entries.decrement_lock(&object_id).await {
                Ok(_) => debug!(object_id = %object_id, "Undid lock count of abandoned acquire"),
                Err(e) => warn!(object_id = %object_id, error = %e, "Could not undo lock count"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    async fn pinned_entry() -> (CacheEntries, ObjectId) {
        let entries = CacheEntries::new(Arc::new(MemoryStore::new()));
        let id = ObjectId::new("ab01").unwrap();
        entries.ensure(&id, 10).await.unwrap();
        assert!(entries.increment_lock(&id).await.unwrap());
        (entries, id)
    }

    #[tokio::test]
    async fn test_dropped_guard_gives_count_back() {
        let (entries, id) = pinned_entry().await;
        drop(PinGuard::new(&entries, &id));

        for _ in 0..100 {
            if entries.get(&id).await.unwrap().unwrap().lock_count == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("lock count was never given back");
    }

    #[tokio::test]
    async fn test_disarmed_guard_keeps_count() {
        let (entries, id) = pinned_entry().await;
        PinGuard::new(&entries, &id).disarm();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(entries.get(&id).await.unwrap().unwrap().lock_count, 1);
    }
}
