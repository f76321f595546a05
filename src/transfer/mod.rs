//! Fetching object bytes into the cache.
//!
//! - [`handler`]: Handler contract, transfer errors, throttled progress
//! - [`local`]: Local filesystem copies
//! - [`http`]: HTTP(S) downloads, zip members via range requests, checksums
//! - [`range_reader`]: `Read + Seek` over HTTP range requests
//! - [`managed`]: Delegation to an external managed transfer service
//! - [`registry`]: Scheme → handler table
//! - [`orchestrator`]: Launches transfers and records their outcome

pub mod handler;
pub mod http;
pub mod local;
pub mod managed;
pub mod orchestrator;
pub mod range_reader;
pub mod registry;
