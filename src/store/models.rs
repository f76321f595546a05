//! Records persisted by the metadata store next to the cache entries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::entry::ObjectId;

/// A caller's receipt for one unit of an entry's `lock_count`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: Uuid,
    pub owner: String,
    pub session_id: String,
    pub object_id: ObjectId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl LockRecord {
    pub fn new(owner: &str, session_id: &str, object_id: ObjectId) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.to_string(),
            session_id: session_id.to_string(),
            object_id,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    Initializing,
    Queued,
    Transferring,
    Done,
    Failed,
    FailedTemporarily,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Done | TransferStatus::Failed | TransferStatus::FailedTemporarily
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Initializing => "initializing",
            TransferStatus::Queued => "queued",
            TransferStatus::Transferring => "transferring",
            TransferStatus::Done => "done",
            TransferStatus::Failed => "failed",
            TransferStatus::FailedTemporarily => "failed_temporarily",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(TransferStatus::Initializing),
            "queued" => Ok(TransferStatus::Queued),
            "transferring" => Ok(TransferStatus::Transferring),
            "done" => Ok(TransferStatus::Done),
            "failed" => Ok(TransferStatus::Failed),
            "failed_temporarily" => Ok(TransferStatus::FailedTemporarily),
            other => Err(format!("unknown transfer status {other:?}")),
        }
    }
}

/// One fetch operation for an object, reused per (object, owner, session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub id: Uuid,
    pub object_id: ObjectId,
    pub owner: String,
    pub session_id: String,
    pub status: TransferStatus,
    pub size_bytes: u64,
    pub transferred_bytes: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

/// Partial update of a transfer record. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferUpdate {
    pub status: Option<TransferStatus>,
    pub size_bytes: Option<u64>,
    pub transferred_bytes: Option<u64>,
    pub started_at: Option<OffsetDateTime>,
    pub ended_at: Option<OffsetDateTime>,
    pub error: Option<Option<String>>,
}

impl TransferUpdate {
    pub fn status(status: TransferStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn apply(&self, record: &mut TransferRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(size) = self.size_bytes {
            record.size_bytes = size;
        }
        if let Some(transferred) = self.transferred_bytes {
            record.transferred_bytes = transferred;
        }
        if self.started_at.is_some() {
            record.started_at = self.started_at;
        }
        if self.ended_at.is_some() {
            record.ended_at = self.ended_at;
        }
        if let Some(ref error) = self.error {
            record.error = error.clone();
        }
    }
}

/// Filter for listing transfers.
#[derive(Debug, Clone, Default)]
pub struct TransferQuery {
    pub owner: Option<String>,
    pub session_id: Option<String>,
    /// Hide transfers that ended before this instant.
    pub ended_after: Option<OffsetDateTime>,
}

impl TransferQuery {
    pub fn matches(&self, record: &TransferRecord) -> bool {
        if let Some(ref owner) = self.owner {
            if &record.owner != owner {
                return false;
            }
        }
        if let Some(ref session) = self.session_id {
            if &record.session_id != session {
                return false;
            }
        }
        match (self.ended_after, record.ended_at) {
            (Some(cutoff), Some(ended)) => ended >= cutoff,
            _ => true,
        }
    }
}

/// A caller's working session; `objects` is the active dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub owner: String,
    pub objects: Vec<ObjectId>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Session {
    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.objects.iter().any(|o| o == object_id)
    }
}

/// Catalog record the cache entry is attached to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub name: String,
    pub size_bytes: u64,
    /// Scheme-qualified URL or bare local path.
    pub source: String,
    /// Expected digest, `sha256:<hex>`.
    #[serde(default)]
    pub checksum: Option<String>,
    /// Member path when `source` is a zip archive.
    #[serde(default)]
    pub archive_member: Option<String>,
}
