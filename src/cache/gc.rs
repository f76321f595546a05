//! Threshold-driven garbage collector.
//!
//! When usage exceeds `capacity × start_fraction`, unlocked cached entries
//! are evicted least-recently-unlocked first until the remaining candidate
//! bytes drop to `capacity × stop_fraction`:
//!
//! ```text
//! should_collect  = used > capacity × start
//! should_stop     = candidate_bytes - collected ≤ capacity × stop
//! ```
//!
//! Each eviction is `reserve_deletion → remove file → mark_deleted →
//! release_deletion_reservation`, with the release running on every path.

use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::entries::CacheEntries;
use crate::cache::entry::{CacheEntry, ObjectId};
use crate::cache::path_mapper::PathMapper;
use crate::config::{CacheSettings, SettingsProvider};
use crate::metrics::Metrics;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum GcError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to remove {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Decides when a sweep starts and when it may stop.
pub trait CollectionThresholds: Send + Sync {
    fn should_collect(&self, settings: &CacheSettings, used: u64) -> bool;

    fn should_stop(&self, settings: &CacheSettings, initial_used: u64, collected: u64) -> bool;
}

/// Thresholds expressed as fractions of total capacity.
pub struct FractionalThresholds;

impl CollectionThresholds for FractionalThresholds {
    fn should_collect(&self, settings: &CacheSettings, used: u64) -> bool {
        used as f64 > settings.total_capacity_bytes as f64 * settings.gc_start_fraction
    }

    fn should_stop(&self, settings: &CacheSettings, initial_used: u64, collected: u64) -> bool {
        initial_used.saturating_sub(collected) as f64
            <= settings.total_capacity_bytes as f64 * settings.gc_stop_fraction
    }
}

/// An eviction candidate ordered by when it was last unlocked; entries that
/// were never stamped sort first.
#[derive(Debug, Clone)]
struct LruCandidate {
    last_unlocked_at: Option<OffsetDateTime>,
    entry: CacheEntry,
}

impl PartialEq for LruCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LruCandidate {}

impl PartialOrd for LruCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LruCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_unlocked_at
            .cmp(&other.last_unlocked_at)
            .then_with(|| self.entry.object_id.cmp(&other.entry.object_id))
    }
}

fn lru_order(entries: Vec<CacheEntry>) -> Vec<CacheEntry> {
    let mut candidates: Vec<LruCandidate> = entries
        .into_iter()
        .map(|entry| {
            if entry.last_unlocked_at.is_none() {
                warn!(object_id = %entry.object_id, "Cached entry has no last-unlocked time");
            }
            LruCandidate {
                last_unlocked_at: entry.last_unlocked_at,
                entry,
            }
        })
        .collect();
    candidates.sort();
    candidates.into_iter().map(|c| c.entry).collect()
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    /// False when the collector was paused or usage was below the start
    /// threshold.
    pub triggered: bool,
    pub candidates: usize,
    pub evicted: usize,
    pub bytes_collected: u64,
    /// The stop threshold was reached and the usage counter refreshed.
    pub reached_target: bool,
}

struct GcState {
    paused: bool,
}

pub struct GarbageCollector {
    entries: CacheEntries,
    settings: Arc<dyn SettingsProvider>,
    thresholds: Box<dyn CollectionThresholds>,
    metrics: Arc<Metrics>,

    /// Serializes sweeps, forced clears, pause and resume.
    state: Mutex<GcState>,
}

impl GarbageCollector {
    pub fn new(
        entries: CacheEntries,
        settings: Arc<dyn SettingsProvider>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::with_thresholds(entries, settings, metrics, Box::new(FractionalThresholds))
    }

    pub fn with_thresholds(
        entries: CacheEntries,
        settings: Arc<dyn SettingsProvider>,
        metrics: Arc<Metrics>,
        thresholds: Box<dyn CollectionThresholds>,
    ) -> Self {
        Self {
            entries,
            settings,
            thresholds,
            metrics,
            state: Mutex::new(GcState { paused: false }),
        }
    }

    /// Run one threshold-driven sweep. No-op while paused.
    pub async fn collect(&self) -> Result<SweepReport, GcError> {
        let state = self.state.lock().await;
        if state.paused {
            debug!("GC paused, skipping sweep");
            return Ok(SweepReport::default());
        }

        let settings = self.settings.settings();
        let store = self.entries.store();
        let used_now = store.used_bytes().await?;
        if !self.thresholds.should_collect(&settings, used_now) {
            debug!(used = used_now, capacity = settings.total_capacity_bytes, "Below GC threshold");
            return Ok(SweepReport::default());
        }

        self.metrics.gc_sweeps.inc();
        let candidates = lru_order(self.entries.list_eviction_candidates().await?);
        let used: u64 = candidates.iter().map(|c| c.size_bytes).sum();
        let mut report = SweepReport {
            triggered: true,
            candidates: candidates.len(),
            ..Default::default()
        };
        info!(used_counter = used_now, candidate_bytes = used, candidates = report.candidates, "Running GC sweep");

        for entry in &candidates {
            if !self.try_delete(entry, &settings).await {
                continue;
            }
            report.evicted += 1;
            report.bytes_collected += entry.size_bytes;

            if self
                .thresholds
                .should_stop(&settings, used, report.bytes_collected)
            {
                let remaining = used.saturating_sub(report.bytes_collected);
                store.set_used_bytes(remaining).await?;
                self.metrics.used_bytes.set(remaining as i64);
                report.reached_target = true;
                break;
            }
        }

        // Without reaching the target the counter is left as is; it is only
        // refreshed from a sweep that knows where it ended.
        drop(state);
        info!(
            evicted = report.evicted,
            bytes = report.bytes_collected,
            reached_target = report.reached_target,
            "GC sweep finished"
        );
        Ok(report)
    }

    /// Evict every eligible entry regardless of thresholds. With `force`,
    /// outstanding locks on cached entries are dropped first, so objects in
    /// use disappear from under their holders.
    pub async fn clear_cache(&self, force: bool) -> Result<SweepReport, GcError> {
        let _state = self.state.lock().await;
        let settings = self.settings.settings();

        let targets = if force {
            let cached = self.entries.list_cached().await?;
            for entry in &cached {
                if entry.lock_count > 0 {
                    let dropped = self.entries.release_all_for_object(&entry.object_id).await?;
                    warn!(object_id = %entry.object_id, dropped, "Force-released locks");
                    self.metrics.locks_held.sub(dropped as i64);
                }
            }
            cached
        } else {
            self.entries.list_eviction_candidates().await?
        };

        let mut report = SweepReport {
            triggered: true,
            candidates: targets.len(),
            ..Default::default()
        };
        for entry in &targets {
            if self.try_delete(entry, &settings).await {
                report.evicted += 1;
                report.bytes_collected += entry.size_bytes;
            }
        }
        self.account_forced(report.bytes_collected).await?;
        info!(force, evicted = report.evicted, bytes = report.bytes_collected, "Cache cleared");
        Ok(report)
    }

    /// Evict a single object if it is eligible.
    pub async fn evict(&self, object_id: &ObjectId) -> Result<bool, GcError> {
        let _state = self.state.lock().await;
        let Some(entry) = self.entries.get(object_id).await? else {
            return Ok(false);
        };
        if !entry.is_eviction_candidate() {
            return Ok(false);
        }
        let settings = self.settings.settings();
        let evicted = self.delete_entry(&entry, &settings).await?;
        if evicted {
            self.account_forced(entry.size_bytes).await?;
        }
        Ok(evicted)
    }

    /// Hint that an object no longer has holders.
    pub fn unreachable(&self, object_id: &ObjectId) {
        debug!(object_id = %object_id, "Object unreachable");
    }

    pub async fn pause(&self) {
        self.state.lock().await.paused = true;
        info!("GC paused");
    }

    pub async fn resume(&self) {
        self.state.lock().await.paused = false;
        info!("GC resumed");
    }

    pub async fn is_paused(&self) -> bool {
        self.state.lock().await.paused
    }

    async fn account_forced(&self, bytes: u64) -> Result<(), GcError> {
        if bytes == 0 {
            return Ok(());
        }
        let used = self
            .entries
            .store()
            .add_used_bytes(-(bytes.min(i64::MAX as u64) as i64))
            .await?;
        self.metrics.used_bytes.set(used as i64);
        Ok(())
    }

    /// Delete one sweep target. Failures are logged and the target skipped.
    async fn try_delete(&self, entry: &CacheEntry, settings: &CacheSettings) -> bool {
        match self.delete_entry(entry, settings).await {
            Ok(true) => true,
            Ok(false) => {
                info!(object_id = %entry.object_id, "Did not delete object");
                false
            }
            Err(e) => {
                warn!(object_id = %entry.object_id, error = %e, "Could not evict object, skipping");
                false
            }
        }
    }

    async fn delete_entry(&self, entry: &CacheEntry, settings: &CacheSettings) -> Result<bool, GcError> {
        let object_id = &entry.object_id;
        if !self.entries.reserve_deletion(object_id).await? {
            return Ok(false);
        }

        let path = entry
            .ps_path
            .clone()
            .unwrap_or_else(|| PathMapper::new(&settings.storage_root).path_for(object_id));
        let removed = self.remove_and_mark(object_id, path).await;
        let released = self.entries.release_deletion_reservation(object_id).await;
        removed?;
        released?;

        self.metrics.gc_evictions.inc();
        self.metrics.gc_bytes_collected.inc_by(entry.size_bytes);
        Ok(true)
    }

    async fn remove_and_mark(&self, object_id: &ObjectId, path: PathBuf) -> Result<(), GcError> {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(object_id = %object_id, path = %path.display(), "Deleted cached file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(object_id = %object_id, path = %path.display(), "Cached file already gone")
            }
            Err(source) => return Err(GcError::Io { path, source }),
        }
        self.entries.mark_deleted(object_id).await?;
        Ok(())
    }

    /// Run [`collect`](Self::collect) forever, sleeping the configured
    /// interval (re-read every cycle) between sweeps.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.collect().await {
                    error!(error = %e, "File collection failure");
                }
                let interval = self.settings.settings().gc_interval_secs.max(1);
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        })
    }
}
