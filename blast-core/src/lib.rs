//! Blast Core - BitTorrent download engine
//!
//! This crate provides the building blocks of a BitTorrent client: piece
//! storage and verification, piece scheduling, the peer wire protocol with
//! its optional encrypted transport, tracker announces and the torrent
//! lifecycle.

pub mod config;
pub mod crypto;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::BlastConfig;
pub use crypto::CryptoError;
pub use storage::StorageError;
pub use torrent::{Torrent, TorrentError, TorrentManager};

/// Core errors that can bubble up from any Blast subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum BlastError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlastError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            BlastError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url } => {
                    format!("Could not connect to tracker: {url}")
                }
                TorrentError::UnsupportedTracker { url } => {
                    format!("Tracker protocol not supported: {url}")
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::Storage(_) => "Could not access download data".to_string(),
                _ => "Download error occurred".to_string(),
            },
            BlastError::Storage(_) => "Storage error occurred".to_string(),
            BlastError::Crypto(_) => "Encryption error occurred".to_string(),
            BlastError::Configuration { reason } => format!("Invalid configuration: {reason}"),
            BlastError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            BlastError::Configuration { .. }
                | BlastError::Torrent(TorrentError::InvalidTorrentFile { .. })
                | BlastError::Torrent(TorrentError::UnsupportedTracker { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, BlastError>;
