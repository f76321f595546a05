//! Pinned-object cache management.
//!
//! - [`entry`]: CacheEntry, ObjectId and the conditional-update language
//! - [`entries`]: Named entry transitions (reservations, cached, deleted)
//! - [`locks`]: Lock registry (acquire / release / wait for bytes)
//! - [`sessions`]: Caller sessions and their datasets
//! - [`gc`]: Threshold-driven LRU garbage collector
//! - [`manager`]: Routes cache events to the orchestrator and collector
//! - [`events`]: Event and notification types
//! - [`path_mapper`]: Object id → cache path

pub mod entries;
pub mod entry;
pub mod events;
pub mod gc;
pub mod locks;
pub mod manager;
pub mod path_mapper;
pub mod sessions;
