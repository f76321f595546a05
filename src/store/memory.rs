//! In-process metadata store.
//!
//! Each cache entry sits behind its own mutex, so conditional updates on one
//! object never contend with updates on another. The outer map lock is only
//! held long enough to look up or insert an entry slot.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{
    LockRecord, ObjectRecord, Session, TransferQuery, TransferRecord, TransferStatus,
    TransferUpdate,
};
use super::{
    CatalogRepo, EntryRepo, LockRepo, MetadataStore, SessionRepo, StoreResult, TransferRepo,
    UsageRepo,
};
use crate::cache::entry::{CacheEntry, EntryFilter, EntryPatch, ObjectId};

type EntrySlot = Arc<Mutex<CacheEntry>>;

#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<ObjectId, EntrySlot>>,
    locks: Mutex<HashMap<Uuid, LockRecord>>,
    transfers: Mutex<HashMap<Uuid, TransferRecord>>,
    sessions: Mutex<HashMap<Uuid, Session>>,
    catalog: RwLock<HashMap<ObjectId, ObjectRecord>>,
    used_bytes: Mutex<u64>,
}

// A panic while a guard is held cannot leave a record half-written (all
// updates are plain field assignments), so poisoned locks are recovered.
fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, object_id: &ObjectId) -> Option<EntrySlot> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(object_id)
            .cloned()
    }

    fn all_slots(&self) -> Vec<EntrySlot> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn apply_if(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
    ) -> Option<CacheEntry> {
        let slot = self.slot(object_id)?;
        let mut entry = guard(&slot);
        if !filter.matches(&entry) {
            return None;
        }
        patch.apply(&mut entry);
        Some(entry.clone())
    }
}

#[async_trait]
impl EntryRepo for MemoryStore {
    async fn ensure_entry(&self, object_id: &ObjectId, size_bytes: u64) -> StoreResult<CacheEntry> {
        let slot = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries
                .entry(object_id.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(CacheEntry::new(object_id.clone(), size_bytes)))
                })
                .clone()
        };
        let entry = guard(&slot).clone();
        Ok(entry)
    }

    async fn get_entry(&self, object_id: &ObjectId) -> StoreResult<Option<CacheEntry>> {
        let Some(slot) = self.slot(object_id) else {
            return Ok(None);
        };
        let entry = guard(&slot).clone();
        Ok(Some(entry))
    }

    async fn update_entry_if(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
    ) -> StoreResult<u64> {
        Ok(u64::from(self.apply_if(object_id, filter, patch).is_some()))
    }

    async fn find_and_update_entry(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
    ) -> StoreResult<Option<CacheEntry>> {
        Ok(self.apply_if(object_id, filter, patch))
    }

    async fn find_entries(&self, filter: &EntryFilter) -> StoreResult<Vec<CacheEntry>> {
        let mut found = Vec::new();
        for slot in self.all_slots() {
            let entry = guard(&slot);
            if filter.matches(&entry) {
                found.push(entry.clone());
            }
        }
        found.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        Ok(found)
    }
}

#[async_trait]
impl LockRepo for MemoryStore {
    async fn insert_lock(&self, lock: &LockRecord) -> StoreResult<()> {
        guard(&self.locks).insert(lock.id, lock.clone());
        Ok(())
    }

    async fn get_lock(&self, id: Uuid) -> StoreResult<Option<LockRecord>> {
        Ok(guard(&self.locks).get(&id).cloned())
    }

    async fn remove_lock(&self, id: Uuid) -> StoreResult<Option<LockRecord>> {
        Ok(guard(&self.locks).remove(&id))
    }

    async fn list_locks(
        &self,
        owner: Option<&str>,
        session_id: Option<&str>,
        object_id: Option<&ObjectId>,
    ) -> StoreResult<Vec<LockRecord>> {
        let mut locks: Vec<LockRecord> = guard(&self.locks)
            .values()
            .filter(|l| owner.map_or(true, |o| l.owner == o))
            .filter(|l| session_id.map_or(true, |s| l.session_id == s))
            .filter(|l| object_id.map_or(true, |id| &l.object_id == id))
            .cloned()
            .collect();
        locks.sort_by_key(|l| l.created_at);
        Ok(locks)
    }

    async fn remove_locks_for_object(&self, object_id: &ObjectId) -> StoreResult<u64> {
        let mut locks = guard(&self.locks);
        let before = locks.len();
        locks.retain(|_, l| &l.object_id != object_id);
        Ok((before - locks.len()) as u64)
    }
}

#[async_trait]
impl TransferRepo for MemoryStore {
    async fn upsert_transfer(
        &self,
        object_id: &ObjectId,
        owner: &str,
        session_id: &str,
    ) -> StoreResult<TransferRecord> {
        let mut transfers = guard(&self.transfers);
        let existing = transfers.values_mut().find(|t| {
            &t.object_id == object_id && t.owner == owner && t.session_id == session_id
        });
        let record = match existing {
            Some(t) => {
                t.status = TransferStatus::Queued;
                t.size_bytes = 0;
                t.transferred_bytes = 0;
                t.started_at = None;
                t.ended_at = None;
                t.error = None;
                t.clone()
            }
            None => {
                let t = TransferRecord {
                    id: Uuid::new_v4(),
                    object_id: object_id.clone(),
                    owner: owner.to_string(),
                    session_id: session_id.to_string(),
                    status: TransferStatus::Queued,
                    size_bytes: 0,
                    transferred_bytes: 0,
                    started_at: None,
                    ended_at: None,
                    error: None,
                };
                transfers.insert(t.id, t.clone());
                t
            }
        };
        Ok(record)
    }

    async fn get_transfer(&self, id: Uuid) -> StoreResult<Option<TransferRecord>> {
        Ok(guard(&self.transfers).get(&id).cloned())
    }

    async fn update_transfer(&self, id: Uuid, update: &TransferUpdate) -> StoreResult<()> {
        if let Some(record) = guard(&self.transfers).get_mut(&id) {
            update.apply(record);
        }
        Ok(())
    }

    async fn list_transfers(&self, query: &TransferQuery) -> StoreResult<Vec<TransferRecord>> {
        let mut transfers: Vec<TransferRecord> = guard(&self.transfers)
            .values()
            .filter(|t| query.matches(t))
            .cloned()
            .collect();
        transfers.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        Ok(transfers)
    }

    async fn list_unfinished_transfers(&self) -> StoreResult<Vec<TransferRecord>> {
        Ok(guard(&self.transfers)
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SessionRepo for MemoryStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        guard(&self.sessions).insert(session.id, session.clone());
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(guard(&self.sessions).get(&id).cloned())
    }

    async fn remove_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        Ok(guard(&self.sessions).remove(&id))
    }
}

#[async_trait]
impl CatalogRepo for MemoryStore {
    async fn put_object(&self, object: &ObjectRecord) -> StoreResult<()> {
        self.catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(object.id.clone(), object.clone());
        Ok(())
    }

    async fn get_object(&self, id: &ObjectId) -> StoreResult<Option<ObjectRecord>> {
        Ok(self
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned())
    }
}

#[async_trait]
impl UsageRepo for MemoryStore {
    async fn used_bytes(&self) -> StoreResult<u64> {
        Ok(*guard(&self.used_bytes))
    }

    async fn set_used_bytes(&self, used: u64) -> StoreResult<()> {
        *guard(&self.used_bytes) = used;
        Ok(())
    }

    async fn add_used_bytes(&self, delta: i64) -> StoreResult<u64> {
        let mut used = guard(&self.used_bytes);
        *used = if delta >= 0 {
            used.saturating_add(delta as u64)
        } else {
            used.saturating_sub(delta.unsigned_abs())
        };
        Ok(*used)
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
