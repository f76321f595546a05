//! Cache entry types and the conditional-update language used by the store.
//!
//! A [`CacheEntry`] is the per-object bookkeeping record. Every mutation of an
//! entry is expressed as an [`EntryFilter`] (the predicate that must hold on the
//! current state) plus an [`EntryPatch`] (the change to apply), and stores
//! apply the pair atomically.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid object id {0:?}: expected 2+ characters from [A-Za-z0-9_-]")]
pub struct InvalidObjectId(pub String);

/// Stable identifier of a cacheable object.
///
/// Restricted to a path-safe alphabet because it doubles as the file name of
/// the cached copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidObjectId> {
        let id = id.into();
        let valid = id.len() >= 2
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(id))
        } else {
            Err(InvalidObjectId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ObjectId {
    type Error = InvalidObjectId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ObjectId> for String {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

/// Who reserved the in-flight transfer of an entry. Crash recovery relaunches
/// the transfer on behalf of this owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOwner {
    pub owner: String,
    pub session_id: String,
}

/// Per-object cache and lock bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub object_id: ObjectId,

    /// Outstanding pins. Equals the number of live lock records.
    pub lock_count: u64,

    /// A complete copy exists at `ps_path`.
    pub cached: bool,

    /// A handler is currently writing into `ps_path`.
    pub transfer_in_progress: bool,

    /// GC or a forced eviction owns deletion of this entry.
    pub delete_in_progress: bool,

    /// Physical location of the cached bytes.
    pub ps_path: Option<PathBuf>,

    /// Set whenever a release brings `lock_count` to zero; drives LRU order.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_unlocked_at: Option<OffsetDateTime>,

    /// Successful transfers, monotonically increasing.
    pub download_count: u64,

    pub size_bytes: u64,

    pub transfer_owner: Option<TransferOwner>,

    /// Reason of the most recent failed transfer.
    pub last_error: Option<String>,
}

impl CacheEntry {
    pub fn new(object_id: ObjectId, size_bytes: u64) -> Self {
        Self {
            object_id,
            lock_count: 0,
            cached: false,
            transfer_in_progress: false,
            delete_in_progress: false,
            ps_path: None,
            last_unlocked_at: None,
            download_count: 0,
            size_bytes,
            transfer_owner: None,
            last_error: None,
        }
    }

    /// Whether the garbage collector may evict this entry.
    pub fn is_eviction_candidate(&self) -> bool {
        self.cached && self.lock_count == 0 && !self.delete_in_progress
    }
}

/// Constraint on `lock_count` inside an [`EntryFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCountFilter {
    Zero,
    Positive,
}

/// Predicate over an entry's current state. `None` fields are unconstrained,
/// so `EntryFilter::default()` matches every entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub cached: Option<bool>,
    pub transfer_in_progress: Option<bool>,
    pub delete_in_progress: Option<bool>,
    pub lock_count: Option<LockCountFilter>,
}

impl EntryFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn cached(mut self, value: bool) -> Self {
        self.cached = Some(value);
        self
    }

    pub fn transfer_in_progress(mut self, value: bool) -> Self {
        self.transfer_in_progress = Some(value);
        self
    }

    pub fn delete_in_progress(mut self, value: bool) -> Self {
        self.delete_in_progress = Some(value);
        self
    }

    pub fn lock_count(mut self, value: LockCountFilter) -> Self {
        self.lock_count = Some(value);
        self
    }

    /// `cached ∧ lock_count == 0 ∧ ¬delete_in_progress`
    pub fn eviction_candidates() -> Self {
        Self::any()
            .cached(true)
            .lock_count(LockCountFilter::Zero)
            .delete_in_progress(false)
    }

    pub fn matches(&self, entry: &CacheEntry) -> bool {
        let lock_ok = match self.lock_count {
            None => true,
            Some(LockCountFilter::Zero) => entry.lock_count == 0,
            Some(LockCountFilter::Positive) => entry.lock_count > 0,
        };
        lock_ok
            && self.cached.map_or(true, |v| entry.cached == v)
            && self
                .transfer_in_progress
                .map_or(true, |v| entry.transfer_in_progress == v)
            && self
                .delete_in_progress
                .map_or(true, |v| entry.delete_in_progress == v)
    }
}

/// A change applied to an entry. Fields left at their default leave the
/// corresponding entry field untouched.
///
/// For `Option<Option<T>>` fields, `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryPatch {
    pub lock_delta: i64,
    pub reset_lock_count: bool,
    pub cached: Option<bool>,
    pub transfer_in_progress: Option<bool>,
    pub delete_in_progress: Option<bool>,
    pub ps_path: Option<Option<PathBuf>>,
    pub transfer_owner: Option<Option<TransferOwner>>,
    pub last_error: Option<Option<String>>,
    pub download_count_delta: u64,
    /// Stamped into `last_unlocked_at` only when the post-update lock count is 0.
    pub unlocked_at_if_idle: Option<OffsetDateTime>,
}

impl EntryPatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the patch in place. Lock count arithmetic saturates at zero.
    pub fn apply(&self, entry: &mut CacheEntry) {
        if self.reset_lock_count {
            entry.lock_count = 0;
        }
        if self.lock_delta >= 0 {
            entry.lock_count = entry.lock_count.saturating_add(self.lock_delta as u64);
        } else {
            entry.lock_count = entry.lock_count.saturating_sub(self.lock_delta.unsigned_abs());
        }
        if let Some(v) = self.cached {
            entry.cached = v;
        }
        if let Some(v) = self.transfer_in_progress {
            entry.transfer_in_progress = v;
        }
        if let Some(v) = self.delete_in_progress {
            entry.delete_in_progress = v;
        }
        if let Some(ref v) = self.ps_path {
            entry.ps_path = v.clone();
        }
        if let Some(ref v) = self.transfer_owner {
            entry.transfer_owner = v.clone();
        }
        if let Some(ref v) = self.last_error {
            entry.last_error = v.clone();
        }
        entry.download_count = entry.download_count.saturating_add(self.download_count_delta);
        if let Some(at) = self.unlocked_at_if_idle {
            if entry.lock_count == 0 {
                entry.last_unlocked_at = Some(at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> CacheEntry {
        CacheEntry::new(ObjectId::new("ab12").unwrap(), 100)
    }

    #[test]
    fn test_object_id_validation() {
        assert!(ObjectId::new("5f3a9c").is_ok());
        assert!(ObjectId::new("a").is_err());
        assert!(ObjectId::new("../etc").is_err());
        assert!(ObjectId::new("a/b").is_err());
    }

    #[test]
    fn test_default_filter_matches_everything() {
        let mut e = entry();
        assert!(EntryFilter::any().matches(&e));
        e.cached = true;
        e.lock_count = 3;
        assert!(EntryFilter::any().matches(&e));
    }

    #[test]
    fn test_eviction_filter() {
        let mut e = entry();
        assert!(!EntryFilter::eviction_candidates().matches(&e));

        e.cached = true;
        assert!(EntryFilter::eviction_candidates().matches(&e));
        assert!(e.is_eviction_candidate());

        e.lock_count = 1;
        assert!(!EntryFilter::eviction_candidates().matches(&e));

        e.lock_count = 0;
        e.delete_in_progress = true;
        assert!(!EntryFilter::eviction_candidates().matches(&e));
    }

    #[test]
    fn test_lock_delta_saturates() {
        let mut e = entry();
        let patch = EntryPatch {
            lock_delta: -1,
            ..Default::default()
        };
        patch.apply(&mut e);
        assert_eq!(e.lock_count, 0);
    }

    #[test]
    fn test_unlock_stamp_only_when_idle() {
        let now = OffsetDateTime::now_utc();
        let mut e = entry();
        e.lock_count = 2;

        let release = EntryPatch {
            lock_delta: -1,
            unlocked_at_if_idle: Some(now),
            ..Default::default()
        };
        release.apply(&mut e);
        assert_eq!(e.lock_count, 1);
        assert!(e.last_unlocked_at.is_none());

        release.apply(&mut e);
        assert_eq!(e.lock_count, 0);
        assert_eq!(e.last_unlocked_at, Some(now));
    }

    #[test]
    fn test_clear_optional_fields() {
        let mut e = entry();
        e.ps_path = Some(PathBuf::from("/tmp/ps/a/b/ab12"));
        e.last_error = Some("boom".into());

        EntryPatch {
            ps_path: Some(None),
            last_error: Some(None),
            ..Default::default()
        }
        .apply(&mut e);

        assert!(e.ps_path.is_none());
        assert!(e.last_error.is_none());
    }
}
