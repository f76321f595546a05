//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;

use pincache::cache::entry::{CacheEntry, ObjectId};
use pincache::config::Config;
use pincache::service::PinCache;
use pincache::store::memory::MemoryStore;
use pincache::store::models::{LockRecord, ObjectRecord, Session};
use pincache::store::MetadataStore;
use pincache::transfer::handler::TransferError;
use pincache::transfer::managed::{ManagedRequest, ManagedTaskState, ManagedTransferService};
use pincache::transfer::registry::HandlerRegistry;

pub const OWNER: &str = "alice";

pub const WAIT: Duration = Duration::from_secs(10);

pub fn oid(id: &str) -> ObjectId {
    ObjectId::new(id).unwrap()
}

/// Config rooted at `root` with short poll intervals.
pub fn test_config(root: &Path, capacity: u64) -> Config {
    let mut config = Config::default();
    config.storage.root = root.to_path_buf();
    config.storage.capacity_bytes = capacity;
    config.transfer.delete_poll_ms = 5;
    config.transfer.cached_poll_ms = 10;
    config
}

/// A running cache over an in-memory store and a scratch storage root.
pub struct Fixture {
    pub cache: Arc<PinCache>,
    pub store: Arc<dyn MetadataStore>,
    pub root: TempDir,
    pub sources: TempDir,
}

impl Fixture {
    pub fn new(capacity: u64) -> Self {
        let registry = HandlerRegistry::from_config(&Config::default()).unwrap();
        Self::with_registry(capacity, registry)
    }

    pub fn with_registry(capacity: u64, registry: HandlerRegistry) -> Self {
        let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
        Self::with_store(capacity, store, registry)
    }

    pub fn with_store(capacity: u64, store: Arc<dyn MetadataStore>, registry: HandlerRegistry) -> Self {
        let root = TempDir::new().unwrap();
        let sources = TempDir::new().unwrap();
        let config = test_config(root.path(), capacity);
        let cache = PinCache::new(&config, store.clone(), registry).unwrap();
        Self {
            cache: Arc::new(cache),
            store,
            root,
            sources,
        }
    }

    /// Register an object whose source is a local file holding `contents`.
    pub async fn local_object(&self, id: &str, contents: &[u8]) -> ObjectId {
        let path = self.sources.path().join(id);
        std::fs::write(&path, contents).unwrap();
        self.register(id, &path.display().to_string(), contents.len() as u64, None, None)
            .await
    }

    pub async fn register(
        &self,
        id: &str,
        source: &str,
        size_bytes: u64,
        checksum: Option<String>,
        archive_member: Option<String>,
    ) -> ObjectId {
        let object = ObjectRecord {
            id: oid(id),
            name: format!("{id}.bin"),
            size_bytes,
            source: source.to_string(),
            checksum,
            archive_member,
        };
        self.cache.put_object(&object).await.unwrap();
        object.id
    }

    pub async fn session(&self, objects: &[&ObjectId]) -> Session {
        self.cache
            .sessions
            .create(OWNER, objects.iter().map(|o| (*o).clone()).collect())
            .await
            .unwrap()
    }

    /// Acquire a lock and wait for the object to land on disk.
    pub async fn lock_cached(&self, object_id: &ObjectId, session: &Session) -> (LockRecord, PathBuf) {
        let lock = self
            .cache
            .locks
            .acquire(object_id, OWNER, session.id)
            .await
            .unwrap();
        let path = self
            .cache
            .locks
            .wait_until_cached(lock.id, OWNER, WAIT)
            .await
            .unwrap();
        self.wait_transfers_finished(object_id).await;
        (lock, path)
    }

    /// Wait until every transfer record of `object_id` is terminal. Usage is
    /// accounted before the record is closed.
    pub async fn wait_transfers_finished(&self, object_id: &ObjectId) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let transfers = self
                .cache
                .orchestrator
                .list_transfers(OWNER, None, false)
                .await
                .unwrap();
            if transfers
                .iter()
                .filter(|t| &t.object_id == object_id)
                .all(|t| t.status.is_terminal())
            {
                return;
            }
            assert!(tokio::time::Instant::now() < deadline, "transfer of {object_id} never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn entry(&self, object_id: &ObjectId) -> CacheEntry {
        self.store.get_entry(object_id).await.unwrap().unwrap()
    }

    /// Poll the entry until `done` holds.
    pub async fn wait_for_entry(&self, object_id: &ObjectId, done: impl Fn(&CacheEntry) -> bool) -> CacheEntry {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if let Some(entry) = self.store.get_entry(object_id).await.unwrap() {
                if done(&entry) {
                    return entry;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {object_id}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until no transfer of `object_id` is in flight.
    pub async fn wait_settled(&self, object_id: &ObjectId) -> CacheEntry {
        self.wait_for_entry(object_id, |e| !e.transfer_in_progress).await
    }
}

// ─── HTTP file server ──────────────────────────────────────────────────────

type Files = Arc<HashMap<String, Vec<u8>>>;

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn serve_file(
    State(files): State<Files>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    let Some(data) = files.get(&name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_range);
    match range {
        Some((start, end)) => {
            let len = data.len();
            let end = end.min(len.saturating_sub(1));
            if start >= len || start > end {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            (
                StatusCode::PARTIAL_CONTENT,
                [(header::CONTENT_RANGE, format!("bytes {start}-{end}/{len}"))],
                data[start..=end].to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::OK, data.clone()).into_response(),
    }
}

/// Serve `files` at `/files/{name}` on an ephemeral port, honouring single
/// byte ranges. Returns the base URL.
pub async fn serve_files(files: HashMap<String, Vec<u8>>) -> String {
    let app = Router::new()
        .route("/files/{name}", get(serve_file))
        .with_state(Arc::new(files));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A zip archive holding the given members, deflated.
pub fn zip_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in members {
        writer
            .start_file(*name, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

// ─── Managed transfer service ──────────────────────────────────────────────

/// Scripted managed service. `submit` materializes `contents` in the drop
/// directory; `status` replays the script and reports success once it runs
/// out.
pub struct FakeManagedService {
    drop_dir: PathBuf,
    contents: Vec<u8>,
    script: Mutex<VecDeque<ManagedTaskState>>,
    pub submitted: Mutex<Vec<ManagedRequest>>,
}

impl FakeManagedService {
    pub fn new(drop_dir: &Path, contents: &[u8], script: Vec<ManagedTaskState>) -> Self {
        Self {
            drop_dir: drop_dir.to_path_buf(),
            contents: contents.to_vec(),
            script: Mutex::new(script.into()),
            submitted: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ManagedTransferService for FakeManagedService {
    async fn submit(&self, request: &ManagedRequest) -> Result<String, TransferError> {
        std::fs::write(self.drop_dir.join(&request.destination_name), &self.contents)
            .map_err(TransferError::from)?;
        self.submitted.lock().unwrap().push(request.clone());
        Ok("task-1".to_string())
    }

    async fn status(&self, _task_id: &str) -> Result<ManagedTaskState, TransferError> {
        Ok(self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ManagedTaskState::Succeeded))
    }
}
