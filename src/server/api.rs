//! HTTP surface over a running [`PinCache`].
//!
//! Callers identify themselves with the `x-pincache-owner` header. Locks,
//! sessions and transfers are scoped to that owner.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use crate::cache::entry::ObjectId;
use crate::cache::gc::SweepReport;
use crate::cache::locks::LockError;
use crate::config::{CacheSettings, SettingsProvider};
use crate::service::{PinCache, StorageUsage};
use crate::store::models::{LockRecord, ObjectRecord, Session, TransferRecord};

/// Header carrying the caller identity.
pub const OWNER_HEADER: &str = "x-pincache-owner";

const DOWNLOAD_CHUNK: usize = 64 * 1024;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<PinCache>,
}

/// Build the axum router with all API routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/objects/{id}", put(put_object))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/locks", post(acquire_lock).get(list_locks))
        .route("/locks/{id}", get(get_lock).delete(release_lock))
        .route("/locks/{id}/download", get(download))
        .route("/transfers", get(list_transfers))
        .route("/cache/usage", get(usage))
        .route("/cache/clear", post(clear_cache))
        .route("/cache/evict/{id}", post(evict))
        .route("/gc/pause", post(pause_gc))
        .route("/gc/resume", post(resume_gc))
        .route("/gc/collect", post(collect))
        .route("/settings", get(get_settings).put(put_settings))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Caller identity taken from [`OWNER_HEADER`].
pub struct Owner(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Owner {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let owner = parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::BadRequest(format!("missing {OWNER_HEADER} header")))?;
        Ok(Owner(owner.to_string()))
    }
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Catalog registration body for `PUT /objects/{id}`.
#[derive(Debug, Deserialize)]
pub struct PutObjectRequest {
    pub name: String,
    pub size_bytes: u64,
    pub source: String,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub archive_member: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub objects: Vec<ObjectId>,
}

#[derive(Debug, Deserialize)]
pub struct AcquireLockRequest {
    pub object_id: ObjectId,
    pub session_id: Uuid,
    /// Block until the object is cached, up to this many seconds.
    #[serde(default)]
    pub wait_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcquireLockResponse {
    pub lock: LockRecord,
    /// Set when the request waited and the object is cached.
    pub ps_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LockQuery {
    pub session_id: Option<String>,
    pub object_id: Option<ObjectId>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransferListQuery {
    pub session_id: Option<String>,
    #[serde(default)]
    pub discard_old: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearQuery {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EvictResponse {
    pub evicted: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GcStatusResponse {
    pub paused: bool,
}

// ─── Handlers ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.cache.store.health_check().await?;
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

async fn metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let body = state
        .cache
        .metrics
        .encode()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response())
}

async fn put_object(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PutObjectRequest>,
) -> ApiResult<StatusCode> {
    let object = ObjectRecord {
        id: ObjectId::new(id)?,
        name: req.name,
        size_bytes: req.size_bytes,
        source: req.source,
        checksum: req.checksum,
        archive_member: req.archive_member,
    };
    state.cache.put_object(&object).await?;
    info!(object_id = %object.id, source = %object.source, "Object registered");
    Ok(StatusCode::NO_CONTENT)
}

async fn create_session(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<CreateSessionRequest>,
) -> ApiResult<(StatusCode, Json<Session>)> {
    let session = state.cache.sessions.create(&owner, req.objects).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    Ok(Json(state.cache.sessions.get(id, &owner).await?))
}

async fn delete_session(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.cache.sessions.delete(id, &owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn acquire_lock(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Json(req): Json<AcquireLockRequest>,
) -> ApiResult<(StatusCode, Json<AcquireLockResponse>)> {
    let locks = &state.cache.locks;
    let lock = locks.acquire(&req.object_id, &owner, req.session_id).await?;

    let ps_path = match req.wait_secs {
        Some(secs) => {
            match locks
                .wait_until_cached(lock.id, &owner, Duration::from_secs(secs))
                .await
            {
                Ok(path) => Some(path.display().to_string()),
                Err(e) => {
                    // The caller never sees the lock id, so give the pin back.
                    if let Err(release) = locks.release(lock.id, &owner).await {
                        warn!(lock_id = %lock.id, error = %release, "Could not release unused lock");
                    }
                    return Err(e.into());
                }
            }
        }
        None => None,
    };
    Ok((StatusCode::CREATED, Json(AcquireLockResponse { lock, ps_path })))
}

async fn list_locks(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<LockQuery>,
) -> ApiResult<Json<Vec<LockRecord>>> {
    let locks = state
        .cache
        .locks
        .list_locks(&owner, query.session_id.as_deref(), query.object_id.as_ref())
        .await?;
    Ok(Json(locks))
}

async fn get_lock(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LockRecord>> {
    let lock = state.cache.locks.get_lock(id).await?;
    if lock.owner != owner {
        return Err(LockError::NotLockOwner(id).into());
    }
    Ok(Json(lock))
}

async fn release_lock(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.cache.locks.release(id, &owner).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stream the cached bytes behind a lock.
async fn download(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let path = state.cache.locks.cached_path(id, &owner).await?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("open {}: {e}", path.display())))?;
    let len = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(format!("stat {}: {e}", path.display())))?
        .len();

    let stream = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), file)))
    });

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

async fn list_transfers(
    State(state): State<AppState>,
    Owner(owner): Owner,
    Query(query): Query<TransferListQuery>,
) -> ApiResult<Json<Vec<TransferRecord>>> {
    let transfers = state
        .cache
        .orchestrator
        .list_transfers(&owner, query.session_id.as_deref(), query.discard_old)
        .await?;
    Ok(Json(transfers))
}

async fn usage(State(state): State<AppState>) -> ApiResult<Json<StorageUsage>> {
    Ok(Json(state.cache.usage().await?))
}

async fn clear_cache(
    State(state): State<AppState>,
    Query(query): Query<ClearQuery>,
) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.cache.gc.clear_cache(query.force).await?))
}

async fn evict(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<EvictResponse>> {
    let object_id = ObjectId::new(id)?;
    let evicted = state.cache.gc.evict(&object_id).await?;
    Ok(Json(EvictResponse { evicted }))
}

async fn pause_gc(State(state): State<AppState>) -> Json<GcStatusResponse> {
    state.cache.gc.pause().await;
    Json(GcStatusResponse { paused: true })
}

async fn resume_gc(State(state): State<AppState>) -> Json<GcStatusResponse> {
    state.cache.gc.resume().await;
    Json(GcStatusResponse { paused: false })
}

async fn collect(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.cache.gc.collect().await?))
}

async fn get_settings(State(state): State<AppState>) -> Json<CacheSettings> {
    Json(state.cache.settings.settings())
}

async fn put_settings(
    State(state): State<AppState>,
    Json(settings): Json<CacheSettings>,
) -> ApiResult<Json<CacheSettings>> {
    state.cache.settings.replace(settings.clone())?;
    info!(
        capacity = settings.total_capacity_bytes,
        start = settings.gc_start_fraction,
        stop = settings.gc_stop_fraction,
        "Settings replaced"
    );
    Ok(Json(settings))
}
