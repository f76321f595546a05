//! pincache: pin-aware local disk cache for large remote data objects.
//!
//! Objects are fetched once into a local storage root, pinned by
//! reference-counted locks while callers use them, and reclaimed in LRU order
//! once usage crosses a configurable threshold.

pub mod cache;
pub mod config;
pub mod metrics;
pub mod server;
pub mod service;
pub mod store;
pub mod transfer;
