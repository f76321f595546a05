//! Prometheus metrics for the cache.
//!
//! Metrics live in a [`Metrics`] value with its own [`Registry`] that is
//! handed to each component, so several caches (and tests) can coexist in one
//! process.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,

    pub transfers_started: IntCounter,
    /// Labelled by terminal status (`done`, `failed`, `failed_temporarily`).
    pub transfers_finished: IntCounterVec,
    pub transfers_active: IntGauge,
    pub bytes_transferred: IntCounter,

    pub locks_held: IntGauge,

    pub gc_sweeps: IntCounter,
    pub gc_evictions: IntCounter,
    pub gc_bytes_collected: IntCounter,
    pub used_bytes: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let transfers_started = IntCounter::new(
            "pincache_transfers_started_total",
            "Total number of transfers launched",
        )?;
        let transfers_finished = IntCounterVec::new(
            Opts::new(
                "pincache_transfers_finished_total",
                "Total number of transfers that reached a terminal status",
            ),
            &["status"],
        )?;
        let transfers_active = IntGauge::new(
            "pincache_transfers_active",
            "Number of transfers currently running",
        )?;
        let bytes_transferred = IntCounter::new(
            "pincache_bytes_transferred_total",
            "Total bytes written into the cache by successful transfers",
        )?;
        let locks_held = IntGauge::new("pincache_locks_held", "Number of live lock records")?;
        let gc_sweeps = IntCounter::new(
            "pincache_gc_sweeps_total",
            "Total number of garbage collection sweeps that ran",
        )?;
        let gc_evictions = IntCounter::new(
            "pincache_gc_evictions_total",
            "Total number of objects evicted from the cache",
        )?;
        let gc_bytes_collected = IntCounter::new(
            "pincache_gc_bytes_collected_total",
            "Total bytes freed by eviction",
        )?;
        let used_bytes = IntGauge::new(
            "pincache_used_bytes",
            "Last known number of bytes used by the cache",
        )?;

        registry.register(Box::new(transfers_started.clone()))?;
        registry.register(Box::new(transfers_finished.clone()))?;
        registry.register(Box::new(transfers_active.clone()))?;
        registry.register(Box::new(bytes_transferred.clone()))?;
        registry.register(Box::new(locks_held.clone()))?;
        registry.register(Box::new(gc_sweeps.clone()))?;
        registry.register(Box::new(gc_evictions.clone()))?;
        registry.register(Box::new(gc_bytes_collected.clone()))?;
        registry.register(Box::new(used_bytes.clone()))?;

        Ok(Self {
            registry,
            transfers_started,
            transfers_finished,
            transfers_active,
            bytes_transferred,
            locks_held,
            gc_sweeps,
            gc_evictions,
            gc_bytes_collected,
            used_bytes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
