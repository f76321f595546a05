//! Metadata store: durable cache entries plus the lock, transfer, session,
//! catalog and usage records around them.
//!
//! - [`models`]: record types
//! - [`memory`]: in-process store with per-entry atomicity
//! - [`sqlite`]: sqlx/SQLite store using single-statement conditional updates
//!
//! Entry mutations go through two primitives that every backend must provide
//! atomically: [`EntryRepo::update_entry_if`] (matched count) and
//! [`EntryRepo::find_and_update_entry`] (post-update document).

pub mod memory;
pub mod models;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::entry::{CacheEntry, EntryFilter, EntryPatch, ObjectId};
use models::{
    LockRecord, ObjectRecord, Session, TransferQuery, TransferRecord, TransferUpdate,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait EntryRepo: Send + Sync {
    /// Create the entry with default state if it does not exist yet.
    /// Returns the entry as stored after the call.
    async fn ensure_entry(&self, object_id: &ObjectId, size_bytes: u64) -> StoreResult<CacheEntry>;

    async fn get_entry(&self, object_id: &ObjectId) -> StoreResult<Option<CacheEntry>>;

    /// Apply `patch` only if `filter` holds on the current state. Returns the
    /// number of matched entries (0 or 1).
    async fn update_entry_if(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
    ) -> StoreResult<u64>;

    /// Like [`update_entry_if`](Self::update_entry_if) but returns the
    /// post-update entry, or `None` if the filter did not match.
    async fn find_and_update_entry(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
    ) -> StoreResult<Option<CacheEntry>>;

    async fn find_entries(&self, filter: &EntryFilter) -> StoreResult<Vec<CacheEntry>>;
}

#[async_trait]
pub trait LockRepo: Send + Sync {
    async fn insert_lock(&self, lock: &LockRecord) -> StoreResult<()>;

    async fn get_lock(&self, id: Uuid) -> StoreResult<Option<LockRecord>>;

    /// Remove and return the lock, or `None` if it was already gone.
    async fn remove_lock(&self, id: Uuid) -> StoreResult<Option<LockRecord>>;

    async fn list_locks(
        &self,
        owner: Option<&str>,
        session_id: Option<&str>,
        object_id: Option<&ObjectId>,
    ) -> StoreResult<Vec<LockRecord>>;

    /// Remove every lock on an object; returns how many were removed.
    async fn remove_locks_for_object(&self, object_id: &ObjectId) -> StoreResult<u64>;
}

#[async_trait]
pub trait TransferRepo: Send + Sync {
    /// Find the transfer for `(object, owner, session)` or create one. Either
    /// way the record is reset to `Queued` with cleared progress and error.
    async fn upsert_transfer(
        &self,
        object_id: &ObjectId,
        owner: &str,
        session_id: &str,
    ) -> StoreResult<TransferRecord>;

    async fn get_transfer(&self, id: Uuid) -> StoreResult<Option<TransferRecord>>;

    async fn update_transfer(&self, id: Uuid, update: &TransferUpdate) -> StoreResult<()>;

    async fn list_transfers(&self, query: &TransferQuery) -> StoreResult<Vec<TransferRecord>>;

    /// Transfers without a terminal status.
    async fn list_unfinished_transfers(&self) -> StoreResult<Vec<TransferRecord>>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn insert_session(&self, session: &Session) -> StoreResult<()>;

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>>;

    async fn remove_session(&self, id: Uuid) -> StoreResult<Option<Session>>;
}

#[async_trait]
pub trait CatalogRepo: Send + Sync {
    async fn put_object(&self, object: &ObjectRecord) -> StoreResult<()>;

    async fn get_object(&self, id: &ObjectId) -> StoreResult<Option<ObjectRecord>>;
}

#[async_trait]
pub trait UsageRepo: Send + Sync {
    async fn used_bytes(&self) -> StoreResult<u64>;

    async fn set_used_bytes(&self, used: u64) -> StoreResult<()>;

    /// Adjust the counter by `delta`, saturating at zero. Returns the new value.
    async fn add_used_bytes(&self, delta: i64) -> StoreResult<u64>;
}

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    EntryRepo + LockRepo + TransferRepo + SessionRepo + CatalogRepo + UsageRepo + Send + Sync
{
    async fn health_check(&self) -> StoreResult<()>;
}
