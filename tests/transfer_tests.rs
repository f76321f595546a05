//! End-to-end transfers through the orchestrator and each handler.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{oid, serve_files, zip_archive, FakeManagedService, Fixture, OWNER, WAIT};
use pincache::cache::entries::CacheEntries;
use pincache::cache::entry::{EntryFilter, EntryPatch};
use pincache::cache::locks::LockError;
use pincache::cache::path_mapper::PathMapper;
use pincache::store::memory::MemoryStore;
use pincache::store::models::{ObjectRecord, TransferStatus};
use pincache::store::MetadataStore;
use pincache::transfer::managed::{ManagedHandler, ManagedTaskState};
use pincache::transfer::registry::{HandlerKind, HandlerRegistry};
use sha2::{Digest, Sha256};

const GIB: u64 = 1024 * 1024 * 1024;

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

#[tokio::test]
async fn test_local_transfer_round_trip() {
    let fx = Fixture::new(GIB);
    let data = vec![7u8; 100_000];
    let a = fx.local_object("ab-local", &data).await;
    let session = fx.session(&[&a]).await;

    let mut completed = fx.cache.orchestrator.subscribe();
    let (_, path) = fx.lock_cached(&a, &session).await;

    // Objects land at root/<c0>/<c1>/<id>.
    assert_eq!(path, PathMapper::new(fx.root.path()).path_for(&a));
    assert_eq!(path, fx.root.path().join("a").join("b").join("ab-local"));
    assert_eq!(std::fs::read(&path).unwrap(), data);

    let event = tokio::time::timeout(WAIT, completed.recv()).await.unwrap().unwrap();
    assert_eq!(event.object_id, a);
    assert_eq!(event.ps_path, path);

    let entry = fx.entry(&a).await;
    assert!(entry.cached);
    assert!(!entry.transfer_in_progress);
    assert_eq!(entry.download_count, 1);
    assert!(entry.transfer_owner.is_none());

    let transfers = fx.cache.orchestrator.list_transfers(OWNER, None, false).await.unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].status, TransferStatus::Done);
    assert_eq!(transfers[0].transferred_bytes, data.len() as u64);
    assert!(transfers[0].started_at.is_some());
    assert!(transfers[0].ended_at.is_some());

    assert_eq!(fx.cache.usage().await.unwrap().used_bytes, data.len() as u64);
}

#[tokio::test]
async fn test_file_url_source() {
    let fx = Fixture::new(GIB);
    let source = fx.sources.path().join("payload");
    std::fs::write(&source, b"from a file url").unwrap();
    let a = fx
        .register("obj-file", &format!("file://{}", source.display()), 15, None, None)
        .await;
    let session = fx.session(&[&a]).await;

    let (_, path) = fx.lock_cached(&a, &session).await;
    assert_eq!(std::fs::read(path).unwrap(), b"from a file url");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_transfer_with_checksum() {
    let data = b"remote bytes over http".to_vec();
    let base = serve_files(HashMap::from([("blob".to_string(), data.clone())])).await;

    let fx = Fixture::new(GIB);
    let a = fx
        .register(
            "obj-http",
            &format!("{base}/files/blob"),
            data.len() as u64,
            Some(sha256(&data)),
            None,
        )
        .await;
    let session = fx.session(&[&a]).await;

    let (_, path) = fx.lock_cached(&a, &session).await;
    assert_eq!(std::fs::read(path).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_http_not_found_is_fatal() {
    let base = serve_files(HashMap::new()).await;

    let fx = Fixture::new(GIB);
    let a = fx
        .register("obj-404", &format!("{base}/files/missing"), 10, None, None)
        .await;
    let session = fx.session(&[&a]).await;
    fx.cache.locks.acquire(&a, OWNER, session.id).await.unwrap();

    let entry = fx.wait_settled(&a).await;
    assert!(!entry.cached);
    assert!(entry.last_error.unwrap().contains("404"));

    let transfers = fx.cache.orchestrator.list_transfers(OWNER, None, false).await.unwrap();
    assert_eq!(transfers[0].status, TransferStatus::Failed);
    assert!(!PathMapper::new(fx.root.path()).path_for(&a).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_checksum_mismatch_discards_file() {
    let data = b"tampered".to_vec();
    let base = serve_files(HashMap::from([("blob".to_string(), data.clone())])).await;

    let fx = Fixture::new(GIB);
    let a = fx
        .register(
            "obj-sum",
            &format!("{base}/files/blob"),
            data.len() as u64,
            Some(sha256(b"original")),
            None,
        )
        .await;
    let session = fx.session(&[&a]).await;
    let lock = fx.cache.locks.acquire(&a, OWNER, session.id).await.unwrap();

    let err = fx
        .cache
        .locks
        .wait_until_cached(lock.id, OWNER, WAIT)
        .await
        .unwrap_err();
    match err {
        LockError::TransferFailed { reason, .. } => {
            assert_eq!(reason, "checksum verification failed")
        }
        other => panic!("unexpected error: {other}"),
    }

    let entry = fx.entry(&a).await;
    assert!(!entry.cached);
    assert!(entry.ps_path.is_none());
    assert!(!PathMapper::new(fx.root.path()).path_for(&a).exists());

    let transfers = fx.cache.orchestrator.list_transfers(OWNER, None, false).await.unwrap();
    assert_eq!(transfers[0].status, TransferStatus::Failed);
    assert_eq!(fx.cache.usage().await.unwrap().used_bytes, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zip_member_over_range_requests() {
    let wanted: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let archive = zip_archive(&[
        ("inner/a.bin", &b"first member"[..]),
        ("inner/b.bin", &wanted[..]),
    ]);
    let base = serve_files(HashMap::from([("archive.zip".to_string(), archive)])).await;

    let fx = Fixture::new(GIB);
    let a = fx
        .register(
            "obj-zip",
            &format!("{base}/files/archive.zip"),
            wanted.len() as u64,
            Some(sha256(&wanted)),
            Some("inner/b.bin".to_string()),
        )
        .await;
    let session = fx.session(&[&a]).await;

    let (_, path) = fx.lock_cached(&a, &session).await;
    assert_eq!(std::fs::read(path).unwrap(), wanted);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_zip_member_missing_is_fatal() {
    let archive = zip_archive(&[("inner/a.bin", &b"only member"[..])]);
    let base = serve_files(HashMap::from([("archive.zip".to_string(), archive)])).await;

    let fx = Fixture::new(GIB);
    let a = fx
        .register(
            "obj-zip",
            &format!("{base}/files/archive.zip"),
            10,
            None,
            Some("inner/nope.bin".to_string()),
        )
        .await;
    let session = fx.session(&[&a]).await;
    fx.cache.locks.acquire(&a, OWNER, session.id).await.unwrap();

    let entry = fx.wait_settled(&a).await;
    assert!(!entry.cached);
    let transfers = fx.cache.orchestrator.list_transfers(OWNER, None, false).await.unwrap();
    assert_eq!(transfers[0].status, TransferStatus::Failed);
}

#[tokio::test]
async fn test_connection_refused_is_temporary() {
    // Grab a free port and close it again.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fx = Fixture::new(GIB);
    let a = fx
        .register("obj-down", &format!("http://{addr}/files/x"), 10, None, None)
        .await;
    let session = fx.session(&[&a]).await;
    fx.cache.locks.acquire(&a, OWNER, session.id).await.unwrap();

    let entry = fx.wait_settled(&a).await;
    assert!(!entry.cached);
    let transfers = fx.cache.orchestrator.list_transfers(OWNER, None, false).await.unwrap();
    assert_eq!(transfers[0].status, TransferStatus::FailedTemporarily);
}

#[tokio::test]
async fn test_unknown_scheme_fails() {
    let fx = Fixture::new(GIB);
    let a = fx.register("obj-gopher", "gopher://host/x", 10, None, None).await;
    let session = fx.session(&[&a]).await;
    fx.cache.locks.acquire(&a, OWNER, session.id).await.unwrap();

    let entry = fx.wait_settled(&a).await;
    assert!(entry.last_error.unwrap().contains("gopher"));
    let transfers = fx.cache.orchestrator.list_transfers(OWNER, None, false).await.unwrap();
    assert_eq!(transfers[0].status, TransferStatus::Failed);
}

fn managed_registry(service: Arc<FakeManagedService>, drop_dir: &std::path::Path) -> HandlerRegistry {
    HandlerRegistry::default()
        .with_handler(
            HandlerKind::Managed,
            Arc::new(ManagedHandler::new(service, drop_dir, Duration::from_millis(10))),
        )
        .with_scheme("globus", HandlerKind::Managed)
}

#[tokio::test]
async fn test_managed_transfer_moves_file() {
    let drop_dir = tempfile::TempDir::new().unwrap();
    let service = Arc::new(FakeManagedService::new(
        drop_dir.path(),
        b"managed payload",
        vec![
            ManagedTaskState::Active { bytes_transferred: 0 },
            ManagedTaskState::Active { bytes_transferred: 7 },
        ],
    ));
    let fx = Fixture::with_registry(GIB, managed_registry(service.clone(), drop_dir.path()));
    let a = fx
        .register("obj-managed", "globus://endpoint-1/data/set/file.bin", 15, None, None)
        .await;
    let session = fx.session(&[&a]).await;

    let (_, path) = fx.lock_cached(&a, &session).await;
    assert_eq!(std::fs::read(&path).unwrap(), b"managed payload");

    let submitted = service.submitted.lock().unwrap().clone();
    assert_eq!(submitted.len(), 1);
    assert_eq!(submitted[0].source_endpoint, "endpoint-1");
    assert_eq!(submitted[0].source_path, "/data/set/file.bin");
    assert_eq!(submitted[0].label, "obj-managed");
    // The temporary file was moved out of the drop directory.
    assert!(!drop_dir.path().join(&submitted[0].destination_name).exists());
}

#[tokio::test]
async fn test_managed_failure_is_final() {
    let drop_dir = tempfile::TempDir::new().unwrap();
    let service = Arc::new(FakeManagedService::new(
        drop_dir.path(),
        b"x",
        vec![ManagedTaskState::Failed {
            reason: Some("endpoint error".to_string()),
        }],
    ));
    let fx = Fixture::with_registry(GIB, managed_registry(service, drop_dir.path()));
    let a = fx.register("obj-managed", "globus://ep/f", 1, None, None).await;
    let session = fx.session(&[&a]).await;
    fx.cache.locks.acquire(&a, OWNER, session.id).await.unwrap();

    let entry = fx.wait_settled(&a).await;
    assert!(entry.last_error.unwrap().contains("endpoint error"));
    let transfers = fx.cache.orchestrator.list_transfers(OWNER, None, false).await.unwrap();
    assert_eq!(transfers[0].status, TransferStatus::Failed);
}

#[tokio::test]
async fn test_managed_inactive_reports_expired_credential() {
    let drop_dir = tempfile::TempDir::new().unwrap();
    let service = Arc::new(FakeManagedService::new(
        drop_dir.path(),
        b"x",
        vec![ManagedTaskState::Inactive],
    ));
    let fx = Fixture::with_registry(GIB, managed_registry(service, drop_dir.path()));
    let a = fx.register("obj-managed", "globus://ep/f", 1, None, None).await;
    let session = fx.session(&[&a]).await;
    fx.cache.locks.acquire(&a, OWNER, session.id).await.unwrap();

    let entry = fx.wait_settled(&a).await;
    assert!(entry.last_error.unwrap().contains("credential expired"));
    assert!(!entry.cached);
}

#[tokio::test]
async fn test_restart_resumes_interrupted_transfer() {
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
    let sources = tempfile::TempDir::new().unwrap();
    let source = sources.path().join("payload");
    std::fs::write(&source, b"resumed").unwrap();

    // State left behind by a process that died mid-transfer.
    let a = oid("obj-resume");
    store
        .put_object(&ObjectRecord {
            id: a.clone(),
            name: "payload".to_string(),
            size_bytes: 7,
            source: source.display().to_string(),
            checksum: None,
            archive_member: None,
        })
        .await
        .unwrap();
    let entries = CacheEntries::new(store.clone());
    entries.ensure(&a, 7).await.unwrap();
    assert!(entries.reserve_transfer(&a, OWNER, "old-session").await.unwrap());

    let fx = Fixture::with_store(GIB, store, HandlerRegistry::default());
    let mut completed = fx.cache.orchestrator.subscribe();
    let _gc = fx.cache.start().await.unwrap();

    let event = tokio::time::timeout(WAIT, completed.recv()).await.unwrap().unwrap();
    assert_eq!(event.object_id, a);
    assert_eq!(std::fs::read(&event.ps_path).unwrap(), b"resumed");
    assert!(fx.entry(&a).await.cached);

    let transfers = fx
        .cache
        .orchestrator
        .list_transfers(OWNER, Some("old-session"), false)
        .await
        .unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].status, TransferStatus::Done);
}

#[tokio::test]
async fn test_restart_without_owner_marks_failed() {
    let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
    let a = oid("obj-orphan");
    store.ensure_entry(&a, 1).await.unwrap();
    store
        .update_entry_if(
            &a,
            &EntryFilter::any(),
            &EntryPatch {
                transfer_in_progress: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let fx = Fixture::with_store(GIB, store, HandlerRegistry::default());
    let handles = fx.cache.orchestrator.restart_interrupted().await.unwrap();
    assert!(handles.is_empty());

    let entry = fx.entry(&a).await;
    assert!(!entry.transfer_in_progress);
    assert!(entry.last_error.is_some());
}

#[tokio::test]
async fn test_recent_transfer_window() {
    let fx = Fixture::new(GIB);
    let a = fx.local_object("obj-a", b"aaaa").await;
    let session = fx.session(&[&a]).await;
    fx.lock_cached(&a, &session).await;

    let session_key = session.id.to_string();
    let recent = fx
        .cache
        .orchestrator
        .list_transfers(OWNER, Some(&session_key), true)
        .await
        .unwrap();
    assert_eq!(recent.len(), 1);

    let others = fx.cache.orchestrator.list_transfers("bob", None, false).await.unwrap();
    assert!(others.is_empty());
}
