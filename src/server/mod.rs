//! HTTP server exposing the cache.
//!
//! - [`api`]: Router, owner extractor and route handlers
//! - [`error`]: API error type and its JSON rendering

pub mod api;
pub mod error;
