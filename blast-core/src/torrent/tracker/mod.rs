//! BitTorrent tracker communication abstractions and implementations.
//!
//! HTTP tracker client following BEP 3. Supports URL encoding of binary
//! parameters, compact peer list parsing and tracker failure reporting.

pub mod client;
pub mod types;

// Re-export public API
pub use client::HttpTrackerClient;
pub use types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, DEFAULT_NUMWANT, TrackerClient};
