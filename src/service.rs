//! Wires the store, handlers, collector and manager into one running cache.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::entries::CacheEntries;
use crate::cache::events;
use crate::cache::gc::GarbageCollector;
use crate::cache::locks::LockRegistry;
use crate::cache::manager::CacheManager;
use crate::cache::sessions::SessionRegistry;
use crate::config::{Config, LiveSettings, SettingsProvider, StoreBackend};
use crate::metrics::Metrics;
use crate::store::memory::MemoryStore;
use crate::store::models::ObjectRecord;
use crate::store::sqlite::SqliteStore;
use crate::store::{MetadataStore, StoreResult};
use crate::transfer::orchestrator::TransferOrchestrator;
use crate::transfer::registry::HandlerRegistry;

/// Storage usage as reported to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageUsage {
    pub total_capacity_bytes: u64,
    pub used_bytes: u64,
}

pub struct PinCache {
    pub store: Arc<dyn MetadataStore>,
    pub settings: Arc<LiveSettings>,
    pub metrics: Arc<Metrics>,
    pub locks: Arc<LockRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub orchestrator: Arc<TransferOrchestrator>,
    pub gc: Arc<GarbageCollector>,
    manager: JoinHandle<()>,
}

impl PinCache {
    /// Open the configured store and handlers, then assemble the cache.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn MetadataStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store.path).await?),
        };
        let handlers = HandlerRegistry::from_config(config)?;
        Self::new(config, store, handlers)
    }

    /// Assemble a cache from explicit parts. Spawns the cache manager, so it
    /// must be called inside a tokio runtime.
    pub fn new(
        config: &Config,
        store: Arc<dyn MetadataStore>,
        handlers: HandlerRegistry,
    ) -> anyhow::Result<Self> {
        let settings = config.cache_settings();
        settings.validate()?;
        let settings = Arc::new(LiveSettings::new(settings));
        let provider: Arc<dyn SettingsProvider> = settings.clone();

        let metrics = Arc::new(Metrics::new()?);
        let (tx, rx) = events::channel();

        let locks = Arc::new(LockRegistry::new(
            store.clone(),
            tx.clone(),
            metrics.clone(),
            Duration::from_millis(config.transfer.delete_poll_ms),
            Duration::from_millis(config.transfer.cached_poll_ms),
        ));
        let sessions = Arc::new(SessionRegistry::new(store.clone(), tx));
        let orchestrator = Arc::new(TransferOrchestrator::new(
            store.clone(),
            Arc::new(handlers),
            provider.clone(),
            metrics.clone(),
        ));
        let gc = Arc::new(GarbageCollector::new(
            CacheEntries::new(store.clone()),
            provider,
            metrics.clone(),
        ));
        let manager = CacheManager::new(orchestrator.clone(), gc.clone()).spawn(rx);

        Ok(Self {
            store,
            settings,
            metrics,
            locks,
            sessions,
            orchestrator,
            gc,
            manager,
        })
    }

    /// Relaunch interrupted transfers and start the periodic collector.
    pub async fn start(&self) -> anyhow::Result<JoinHandle<()>> {
        let restarted = self.orchestrator.restart_interrupted().await?;
        if !restarted.is_empty() {
            info!(count = restarted.len(), "Restarted interrupted transfers");
        }
        Ok(self.gc.clone().spawn())
    }

    /// Register or replace the catalog record of an object.
    pub async fn put_object(&self, object: &ObjectRecord) -> StoreResult<()> {
        self.store.put_object(object).await
    }

    pub async fn usage(&self) -> StoreResult<StorageUsage> {
        Ok(StorageUsage {
            total_capacity_bytes: self.settings.settings().total_capacity_bytes,
            used_bytes: self.store.used_bytes().await?,
        })
    }
}

impl Drop for PinCache {
    fn drop(&mut self) {
        self.manager.abort();
    }
}
