//! SQLite-backed metadata store.
//!
//! Entry transitions compile to a single `UPDATE ... WHERE <filter>` statement
//! (plus `RETURNING *` for find-and-update), so atomicity comes from SQLite
//! itself rather than from any lock held in this process.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Pool, Row, Sqlite};
use time::OffsetDateTime;
use uuid::Uuid;

use super::models::{
    LockRecord, ObjectRecord, Session, TransferQuery, TransferRecord, TransferUpdate,
};
use super::{
    CatalogRepo, EntryRepo, LockRepo, MetadataStore, SessionRepo, StoreError, StoreResult,
    TransferRepo, UsageRepo,
};
use crate::cache::entry::{
    CacheEntry, EntryFilter, EntryPatch, LockCountFilter, ObjectId, TransferOwner,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cache_entries (
        object_id TEXT PRIMARY KEY,
        lock_count INTEGER NOT NULL DEFAULT 0,
        cached INTEGER NOT NULL DEFAULT 0,
        transfer_in_progress INTEGER NOT NULL DEFAULT 0,
        delete_in_progress INTEGER NOT NULL DEFAULT 0,
        ps_path TEXT,
        last_unlocked_at TEXT,
        download_count INTEGER NOT NULL DEFAULT 0,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        transfer_owner TEXT,
        transfer_session TEXT,
        last_error TEXT
    )",
    "CREATE TABLE IF NOT EXISTS locks (
        id BLOB PRIMARY KEY,
        owner TEXT NOT NULL,
        session_id TEXT NOT NULL,
        object_id TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_locks_object ON locks (object_id)",
    "CREATE TABLE IF NOT EXISTS transfers (
        id BLOB PRIMARY KEY,
        object_id TEXT NOT NULL,
        owner TEXT NOT NULL,
        session_id TEXT NOT NULL,
        status TEXT NOT NULL,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        transferred_bytes INTEGER NOT NULL DEFAULT 0,
        started_at TEXT,
        ended_at TEXT,
        error TEXT,
        UNIQUE (object_id, owner, session_id)
    )",
    "CREATE TABLE IF NOT EXISTS sessions (
        id BLOB PRIMARY KEY,
        owner TEXT NOT NULL,
        objects TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS objects (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        source TEXT NOT NULL,
        checksum TEXT,
        archive_member TEXT
    )",
    "CREATE TABLE IF NOT EXISTS storage_usage (
        id INTEGER PRIMARY KEY CHECK (id = 0),
        used_bytes INTEGER NOT NULL
    )",
    "INSERT OR IGNORE INTO storage_usage (id, used_bytes) VALUES (0, 0)",
];

pub struct SqliteStore {
    pool: Pool<Sqlite>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // One connection serializes every statement; conditional updates stay
        // atomic and "database is locked" errors cannot occur.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool, path };
        store.migrate().await?;
        tracing::info!(path = %store.path.display(), "SQLite metadata store ready");
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for in-flight statements and close every connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn filter_sql(filter: &EntryFilter) -> String {
    let mut sql = String::new();
    let flag = |b: bool| if b { 1 } else { 0 };
    if let Some(v) = filter.cached {
        sql.push_str(&format!(" AND cached = {}", flag(v)));
    }
    if let Some(v) = filter.transfer_in_progress {
        sql.push_str(&format!(" AND transfer_in_progress = {}", flag(v)));
    }
    if let Some(v) = filter.delete_in_progress {
        sql.push_str(&format!(" AND delete_in_progress = {}", flag(v)));
    }
    match filter.lock_count {
        Some(LockCountFilter::Zero) => sql.push_str(" AND lock_count = 0"),
        Some(LockCountFilter::Positive) => sql.push_str(" AND lock_count > 0"),
        None => {}
    }
    sql
}

enum Arg {
    Text(Option<String>),
    Time(Option<OffsetDateTime>),
}

/// Build the `SET` clause for a patch. Booleans and deltas are rendered as
/// literals; free-form values become bind parameters, returned in order.
fn patch_sql(patch: &EntryPatch) -> (String, Vec<Arg>) {
    let flag = |b: bool| if b { 1 } else { 0 };
    let base = if patch.reset_lock_count { "0" } else { "lock_count" };
    let new_lock = format!("MAX({base} + ({}), 0)", patch.lock_delta);

    let mut sets = vec![format!("lock_count = {new_lock}")];
    let mut args = Vec::new();

    if let Some(v) = patch.cached {
        sets.push(format!("cached = {}", flag(v)));
    }
    if let Some(v) = patch.transfer_in_progress {
        sets.push(format!("transfer_in_progress = {}", flag(v)));
    }
    if let Some(v) = patch.delete_in_progress {
        sets.push(format!("delete_in_progress = {}", flag(v)));
    }
    if let Some(ref v) = patch.ps_path {
        sets.push("ps_path = ?".to_string());
        args.push(Arg::Text(v.as_ref().map(|p| p.to_string_lossy().into_owned())));
    }
    if let Some(ref v) = patch.transfer_owner {
        sets.push("transfer_owner = ?".to_string());
        sets.push("transfer_session = ?".to_string());
        args.push(Arg::Text(v.as_ref().map(|o| o.owner.clone())));
        args.push(Arg::Text(v.as_ref().map(|o| o.session_id.clone())));
    }
    if let Some(ref v) = patch.last_error {
        sets.push("last_error = ?".to_string());
        args.push(Arg::Text(v.clone()));
    }
    if patch.download_count_delta > 0 {
        sets.push(format!(
            "download_count = download_count + {}",
            patch.download_count_delta
        ));
    }
    if let Some(at) = patch.unlocked_at_if_idle {
        // SET expressions see the pre-update row, so test the new count here.
        sets.push(format!(
            "last_unlocked_at = CASE WHEN {new_lock} = 0 THEN ? ELSE last_unlocked_at END"
        ));
        args.push(Arg::Time(Some(at)));
    }

    (sets.join(", "), args)
}

fn entry_from_row(row: &SqliteRow) -> StoreResult<CacheEntry> {
    let id: String = row.try_get("object_id")?;
    let object_id = ObjectId::new(id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let owner: Option<String> = row.try_get("transfer_owner")?;
    let session: Option<String> = row.try_get("transfer_session")?;
    let ps_path: Option<String> = row.try_get("ps_path")?;

    Ok(CacheEntry {
        object_id,
        lock_count: row.try_get::<i64, _>("lock_count")?.max(0) as u64,
        cached: row.try_get("cached")?,
        transfer_in_progress: row.try_get("transfer_in_progress")?,
        delete_in_progress: row.try_get("delete_in_progress")?,
        ps_path: ps_path.map(PathBuf::from),
        last_unlocked_at: row.try_get("last_unlocked_at")?,
        download_count: row.try_get::<i64, _>("download_count")?.max(0) as u64,
        size_bytes: row.try_get::<i64, _>("size_bytes")?.max(0) as u64,
        transfer_owner: match (owner, session) {
            (Some(owner), Some(session_id)) => Some(TransferOwner { owner, session_id }),
            _ => None,
        },
        last_error: row.try_get("last_error")?,
    })
}

fn lock_from_row(row: &SqliteRow) -> StoreResult<LockRecord> {
    let object_id: String = row.try_get("object_id")?;
    Ok(LockRecord {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        session_id: row.try_get("session_id")?,
        object_id: ObjectId::new(object_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: row.try_get("created_at")?,
    })
}

fn transfer_from_row(row: &SqliteRow) -> StoreResult<TransferRecord> {
    let object_id: String = row.try_get("object_id")?;
    let status: String = row.try_get("status")?;
    Ok(TransferRecord {
        id: row.try_get("id")?,
        object_id: ObjectId::new(object_id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        owner: row.try_get("owner")?,
        session_id: row.try_get("session_id")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        size_bytes: row.try_get::<i64, _>("size_bytes")?.max(0) as u64,
        transferred_bytes: row.try_get::<i64, _>("transferred_bytes")?.max(0) as u64,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
        error: row.try_get("error")?,
    })
}

fn session_from_row(row: &SqliteRow) -> StoreResult<Session> {
    let objects: String = row.try_get("objects")?;
    Ok(Session {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        objects: serde_json::from_str(&objects).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        created_at: row.try_get("created_at")?,
    })
}

fn object_from_row(row: &SqliteRow) -> StoreResult<ObjectRecord> {
    let id: String = row.try_get("id")?;
    Ok(ObjectRecord {
        id: ObjectId::new(id).map_err(|e| StoreError::Corrupt(e.to_string()))?,
        name: row.try_get("name")?,
        size_bytes: row.try_get::<i64, _>("size_bytes")?.max(0) as u64,
        source: row.try_get("source")?,
        checksum: row.try_get("checksum")?,
        archive_member: row.try_get("archive_member")?,
    })
}

impl SqliteStore {
    async fn run_entry_update(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
        returning: bool,
    ) -> StoreResult<(u64, Option<CacheEntry>)> {
        let (sets, args) = patch_sql(patch);
        let sql = format!(
            "UPDATE cache_entries SET {sets} WHERE object_id = ?{}{}",
            filter_sql(filter),
            if returning { " RETURNING *" } else { "" }
        );

        let mut query = sqlx::query(&sql);
        for arg in args {
            query = match arg {
                Arg::Text(v) => query.bind(v),
                Arg::Time(v) => query.bind(v),
            };
        }
        let query = query.bind(object_id.as_str());

        if returning {
            match query.fetch_optional(&self.pool).await? {
                Some(row) => Ok((1, Some(entry_from_row(&row)?))),
                None => Ok((0, None)),
            }
        } else {
            let result = query.execute(&self.pool).await?;
            Ok((result.rows_affected(), None))
        }
    }
}

#[async_trait]
impl EntryRepo for SqliteStore {
    async fn ensure_entry(&self, object_id: &ObjectId, size_bytes: u64) -> StoreResult<CacheEntry> {
        sqlx::query(
            "INSERT INTO cache_entries (object_id, size_bytes) VALUES (?, ?)
             ON CONFLICT (object_id) DO NOTHING",
        )
        .bind(object_id.as_str())
        .bind(size_bytes as i64)
        .execute(&self.pool)
        .await?;

        self.get_entry(object_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(object_id.to_string()))
    }

    async fn get_entry(&self, object_id: &ObjectId) -> StoreResult<Option<CacheEntry>> {
        let row = sqlx::query("SELECT * FROM cache_entries WHERE object_id = ?")
            .bind(object_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn update_entry_if(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
    ) -> StoreResult<u64> {
        let (matched, _) = self.run_entry_update(object_id, filter, patch, false).await?;
        Ok(matched)
    }

    async fn find_and_update_entry(
        &self,
        object_id: &ObjectId,
        filter: &EntryFilter,
        patch: &EntryPatch,
    ) -> StoreResult<Option<CacheEntry>> {
        let (_, entry) = self.run_entry_update(object_id, filter, patch, true).await?;
        Ok(entry)
    }

    async fn find_entries(&self, filter: &EntryFilter) -> StoreResult<Vec<CacheEntry>> {
        let sql = format!(
            "SELECT * FROM cache_entries WHERE 1 = 1{} ORDER BY object_id",
            filter_sql(filter)
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }
}

#[async_trait]
impl LockRepo for SqliteStore {
    async fn insert_lock(&self, lock: &LockRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO locks (id, owner, session_id, object_id, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(lock.id)
        .bind(&lock.owner)
        .bind(&lock.session_id)
        .bind(lock.object_id.as_str())
        .bind(lock.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_lock(&self, id: Uuid) -> StoreResult<Option<LockRecord>> {
        let row = sqlx::query("SELECT * FROM locks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn remove_lock(&self, id: Uuid) -> StoreResult<Option<LockRecord>> {
        let row = sqlx::query("DELETE FROM locks WHERE id = ? RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(lock_from_row).transpose()
    }

    async fn list_locks(
        &self,
        owner: Option<&str>,
        session_id: Option<&str>,
        object_id: Option<&ObjectId>,
    ) -> StoreResult<Vec<LockRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM locks
             WHERE (?1 IS NULL OR owner = ?1)
               AND (?2 IS NULL OR session_id = ?2)
               AND (?3 IS NULL OR object_id = ?3)
             ORDER BY created_at",
        )
        .bind(owner)
        .bind(session_id)
        .bind(object_id.map(|o| o.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lock_from_row).collect()
    }

    async fn remove_locks_for_object(&self, object_id: &ObjectId) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM locks WHERE object_id = ?")
            .bind(object_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TransferRepo for SqliteStore {
    async fn upsert_transfer(
        &self,
        object_id: &ObjectId,
        owner: &str,
        session_id: &str,
    ) -> StoreResult<TransferRecord> {
        let row = sqlx::query(
            "INSERT INTO transfers (id, object_id, owner, session_id, status)
             VALUES (?, ?, ?, ?, 'queued')
             ON CONFLICT (object_id, owner, session_id) DO UPDATE SET
                status = 'queued', size_bytes = 0, transferred_bytes = 0,
                started_at = NULL, ended_at = NULL, error = NULL
             RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(object_id.as_str())
        .bind(owner)
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        transfer_from_row(&row)
    }

    async fn get_transfer(&self, id: Uuid) -> StoreResult<Option<TransferRecord>> {
        let row = sqlx::query("SELECT * FROM transfers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(transfer_from_row).transpose()
    }

    async fn update_transfer(&self, id: Uuid, update: &TransferUpdate) -> StoreResult<()> {
        sqlx::query(
            "UPDATE transfers SET
                status = COALESCE(?, status),
                size_bytes = COALESCE(?, size_bytes),
                transferred_bytes = COALESCE(?, transferred_bytes),
                started_at = COALESCE(?, started_at),
                ended_at = COALESCE(?, ended_at),
                error = CASE WHEN ? THEN ? ELSE error END
             WHERE id = ?",
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(update.size_bytes.map(|v| v as i64))
        .bind(update.transferred_bytes.map(|v| v as i64))
        .bind(update.started_at)
        .bind(update.ended_at)
        .bind(update.error.is_some())
        .bind(update.error.clone().flatten())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_transfers(&self, query: &TransferQuery) -> StoreResult<Vec<TransferRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM transfers
             WHERE (?1 IS NULL OR owner = ?1)
               AND (?2 IS NULL OR session_id = ?2)
             ORDER BY object_id",
        )
        .bind(query.owner.as_deref())
        .bind(query.session_id.as_deref())
        .fetch_all(&self.pool)
        .await?;

        let mut transfers = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = transfer_from_row(row)?;
            if query.matches(&record) {
                transfers.push(record);
            }
        }
        Ok(transfers)
    }

    async fn list_unfinished_transfers(&self) -> StoreResult<Vec<TransferRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM transfers
             WHERE status NOT IN ('done', 'failed', 'failed_temporarily')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(transfer_from_row).collect()
    }
}

#[async_trait]
impl SessionRepo for SqliteStore {
    async fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let objects =
            serde_json::to_string(&session.objects).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        sqlx::query("INSERT INTO sessions (id, owner, objects, created_at) VALUES (?, ?, ?, ?)")
            .bind(session.id)
            .bind(&session.owner)
            .bind(objects)
            .bind(session.created_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn remove_session(&self, id: Uuid) -> StoreResult<Option<Session>> {
        let row = sqlx::query("DELETE FROM sessions WHERE id = ? RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }
}

#[async_trait]
impl CatalogRepo for SqliteStore {
    async fn put_object(&self, object: &ObjectRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO objects (id, name, size_bytes, source, checksum, archive_member)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name, size_bytes = excluded.size_bytes,
                source = excluded.source, checksum = excluded.checksum,
                archive_member = excluded.archive_member",
        )
        .bind(object.id.as_str())
        .bind(&object.name)
        .bind(object.size_bytes as i64)
        .bind(&object.source)
        .bind(&object.checksum)
        .bind(&object.archive_member)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_object(&self, id: &ObjectId) -> StoreResult<Option<ObjectRecord>> {
        let row = sqlx::query("SELECT * FROM objects WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(object_from_row).transpose()
    }
}

#[async_trait]
impl UsageRepo for SqliteStore {
    async fn used_bytes(&self) -> StoreResult<u64> {
        let used: i64 = sqlx::query_scalar("SELECT used_bytes FROM storage_usage WHERE id = 0")
            .fetch_one(&self.pool)
            .await?;
        Ok(used.max(0) as u64)
    }

    async fn set_used_bytes(&self, used: u64) -> StoreResult<()> {
        sqlx::query("UPDATE storage_usage SET used_bytes = ? WHERE id = 0")
            .bind(used as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_used_bytes(&self, delta: i64) -> StoreResult<u64> {
        let used: i64 = sqlx::query_scalar(
            "UPDATE storage_usage SET used_bytes = MAX(used_bytes + ?, 0) WHERE id = 0
             RETURNING used_bytes",
        )
        .bind(delta)
        .fetch_one(&self.pool)
        .await?;
        Ok(used.max(0) as u64)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
