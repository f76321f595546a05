//! Named state transitions of a cache entry.
//!
//! Each method is exactly one conditional update against the metadata store;
//! the filter is the transition's precondition. A `false` / `None` result
//! means another actor got there first, not that something failed.

use std::path::PathBuf;
use std::sync::Arc;

use time::OffsetDateTime;
use tracing::debug;

use crate::cache::entry::{
    CacheEntry, EntryFilter, EntryPatch, LockCountFilter, ObjectId, TransferOwner,
};
use crate::store::{MetadataStore, StoreResult};

#[derive(Clone)]
pub struct CacheEntries {
    store: Arc<dyn MetadataStore>,
}

impl CacheEntries {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub async fn ensure(&self, object_id: &ObjectId, size_bytes: u64) -> StoreResult<CacheEntry> {
        self.store.ensure_entry(object_id, size_bytes).await
    }

    pub async fn get(&self, object_id: &ObjectId) -> StoreResult<Option<CacheEntry>> {
        self.store.get_entry(object_id).await
    }

    /// `lock_count += 1` unless a deletion holds the entry.
    pub async fn increment_lock(&self, object_id: &ObjectId) -> StoreResult<bool> {
        let matched = self
            .store
            .update_entry_if(
                object_id,
                &EntryFilter::any().delete_in_progress(false),
                &EntryPatch {
                    lock_delta: 1,
                    ..Default::default()
                },
            )
            .await?;
        Ok(matched == 1)
    }

    /// `lock_count -= 1`, guarded so the count never goes negative. Stamps
    /// `last_unlocked_at` when the count reaches zero. Returns the entry after
    /// the update, or `None` when there was no lock to release.
    pub async fn decrement_lock(&self, object_id: &ObjectId) -> StoreResult<Option<CacheEntry>> {
        self.store
            .find_and_update_entry(
                object_id,
                &EntryFilter::any().lock_count(LockCountFilter::Positive),
                &EntryPatch {
                    lock_delta: -1,
                    unlocked_at_if_idle: Some(OffsetDateTime::now_utc()),
                    ..Default::default()
                },
            )
            .await
    }

    /// Claim the single transfer slot of an uncached entry. The winner is the
    /// only actor allowed to launch a transfer until the entry is marked
    /// cached or failed.
    pub async fn reserve_transfer(
        &self,
        object_id: &ObjectId,
        owner: &str,
        session_id: &str,
    ) -> StoreResult<bool> {
        let matched = self
            .store
            .update_entry_if(
                object_id,
                &EntryFilter::any().transfer_in_progress(false).cached(false),
                &EntryPatch {
                    transfer_in_progress: Some(true),
                    transfer_owner: Some(Some(TransferOwner {
                        owner: owner.to_string(),
                        session_id: session_id.to_string(),
                    })),
                    last_error: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        Ok(matched == 1)
    }

    pub async fn reserve_deletion(&self, object_id: &ObjectId) -> StoreResult<bool> {
        let matched = self
            .store
            .update_entry_if(
                object_id,
                &EntryFilter::eviction_candidates(),
                &EntryPatch {
                    delete_in_progress: Some(true),
                    ..Default::default()
                },
            )
            .await?;
        Ok(matched == 1)
    }

    pub async fn release_deletion_reservation(&self, object_id: &ObjectId) -> StoreResult<()> {
        self.store
            .update_entry_if(
                object_id,
                &EntryFilter::any(),
                &EntryPatch {
                    delete_in_progress: Some(false),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn mark_cached(&self, object_id: &ObjectId, ps_path: PathBuf) -> StoreResult<()> {
        debug!(object_id = %object_id, path = %ps_path.display(), "Marking entry cached");
        self.store
            .update_entry_if(
                object_id,
                &EntryFilter::any(),
                &EntryPatch {
                    cached: Some(true),
                    transfer_in_progress: Some(false),
                    ps_path: Some(Some(ps_path)),
                    transfer_owner: Some(None),
                    last_error: Some(None),
                    download_count_delta: 1,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn mark_transfer_failed(&self, object_id: &ObjectId, reason: &str) -> StoreResult<()> {
        self.store
            .update_entry_if(
                object_id,
                &EntryFilter::any(),
                &EntryPatch {
                    transfer_in_progress: Some(false),
                    transfer_owner: Some(None),
                    last_error: Some(Some(reason.to_string())),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// The cached copy is gone; clears the deletion reservation with it.
    pub async fn mark_deleted(&self, object_id: &ObjectId) -> StoreResult<()> {
        self.store
            .update_entry_if(
                object_id,
                &EntryFilter::any(),
                &EntryPatch {
                    cached: Some(false),
                    delete_in_progress: Some(false),
                    ps_path: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    pub async fn list_eviction_candidates(&self) -> StoreResult<Vec<CacheEntry>> {
        self.store
            .find_entries(&EntryFilter::eviction_candidates())
            .await
    }

    pub async fn list_in_flight(&self) -> StoreResult<Vec<CacheEntry>> {
        self.store
            .find_entries(&EntryFilter::any().transfer_in_progress(true))
            .await
    }

    pub async fn list_cached(&self) -> StoreResult<Vec<CacheEntry>> {
        self.store.find_entries(&EntryFilter::any().cached(true)).await
    }

    /// Drop every lock record on the object and reset its lock count.
    /// Returns the number of lock records removed.
    pub async fn release_all_for_object(&self, object_id: &ObjectId) -> StoreResult<u64> {
        let removed = self.store.remove_locks_for_object(object_id).await?;
        self.store
            .update_entry_if(
                object_id,
                &EntryFilter::any(),
                &EntryPatch {
                    reset_lock_count: true,
                    unlocked_at_if_idle: Some(OffsetDateTime::now_utc()),
                    ..Default::default()
                },
            )
            .await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::models::LockRecord;

    fn oid(s: &str) -> ObjectId {
        ObjectId::new(s).unwrap()
    }

    async fn entries_with(id: &ObjectId) -> CacheEntries {
        let entries = CacheEntries::new(Arc::new(MemoryStore::new()));
        entries.ensure(id, 10).await.unwrap();
        entries
    }

    #[tokio::test]
    async fn test_transfer_reservation_is_single_flight() {
        let id = oid("aa01");
        let entries = entries_with(&id).await;

        assert!(entries.reserve_transfer(&id, "alice", "s1").await.unwrap());
        assert!(!entries.reserve_transfer(&id, "bob", "s2").await.unwrap());

        entries.mark_cached(&id, PathBuf::from("/tmp/ps/a/a/aa01")).await.unwrap();
        // Cached entries cannot be reserved again.
        assert!(!entries.reserve_transfer(&id, "bob", "s2").await.unwrap());

        let entry = entries.get(&id).await.unwrap().unwrap();
        assert!(entry.cached);
        assert!(!entry.transfer_in_progress);
        assert!(entry.transfer_owner.is_none());
        assert_eq!(entry.download_count, 1);
    }

    #[tokio::test]
    async fn test_failed_transfer_can_be_retried() {
        let id = oid("aa02");
        let entries = entries_with(&id).await;

        assert!(entries.reserve_transfer(&id, "alice", "s1").await.unwrap());
        entries.mark_transfer_failed(&id, "connection reset").await.unwrap();

        let entry = entries.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.last_error.as_deref(), Some("connection reset"));
        assert!(!entry.cached);

        assert!(entries.reserve_transfer(&id, "alice", "s1").await.unwrap());
        let entry = entries.get(&id).await.unwrap().unwrap();
        assert!(entry.last_error.is_none());
    }

    #[tokio::test]
    async fn test_deletion_blocks_lock_increment() {
        let id = oid("aa03");
        let entries = entries_with(&id).await;
        entries.mark_cached(&id, PathBuf::from("/x")).await.unwrap();

        assert!(entries.reserve_deletion(&id).await.unwrap());
        assert!(!entries.reserve_deletion(&id).await.unwrap());
        assert!(!entries.increment_lock(&id).await.unwrap());

        entries.mark_deleted(&id).await.unwrap();
        assert!(!entries.get(&id).await.unwrap().unwrap().delete_in_progress);
        entries.release_deletion_reservation(&id).await.unwrap();
        assert!(entries.increment_lock(&id).await.unwrap());

        let entry = entries.get(&id).await.unwrap().unwrap();
        assert!(!entry.cached);
        assert!(entry.ps_path.is_none());
        assert_eq!(entry.lock_count, 1);
    }

    #[tokio::test]
    async fn test_locked_entry_cannot_be_reserved_for_deletion() {
        let id = oid("aa04");
        let entries = entries_with(&id).await;
        entries.mark_cached(&id, PathBuf::from("/x")).await.unwrap();
        entries.increment_lock(&id).await.unwrap();

        assert!(!entries.reserve_deletion(&id).await.unwrap());
        assert!(entries.list_eviction_candidates().await.unwrap().is_empty());

        let after = entries.decrement_lock(&id).await.unwrap().unwrap();
        assert_eq!(after.lock_count, 0);
        assert!(after.last_unlocked_at.is_some());
        assert_eq!(entries.list_eviction_candidates().await.unwrap().len(), 1);

        assert!(entries.decrement_lock(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_release_all_for_object() {
        let id = oid("aa05");
        let entries = entries_with(&id).await;
        for owner in ["alice", "bob"] {
            entries
                .store()
                .insert_lock(&LockRecord::new(owner, "s1", id.clone()))
                .await
                .unwrap();
            entries.increment_lock(&id).await.unwrap();
        }

        assert_eq!(entries.release_all_for_object(&id).await.unwrap(), 2);
        let entry = entries.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.lock_count, 0);
        assert!(entry.last_unlocked_at.is_some());
        assert!(entries
            .store()
            .list_locks(None, None, Some(&id))
            .await
            .unwrap()
            .is_empty());
    }
}
