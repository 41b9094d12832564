//! Undertow Core - BitTorrent session engine
//!
//! This crate provides a complete torrent session engine: piece tracking and
//! verification, peer connection management, tracker scheduling with tiered
//! failover, bandwidth and queue policy, and file storage. The engine runs as
//! a single actor; the excluded presentation/control layer drives it through
//! `EngineHandle` and consumes plain-data snapshots.

pub mod config;
pub mod engine;
pub mod network;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::{EncryptionPolicy, SessionLimits, SpeedSchedule, UndertowConfig};
pub use engine::{spawn_engine, EngineHandle, SessionSnapshot, TorrentState};
pub use network::BandwidthScheduler;
pub use storage::{FileStorage, StorageError};
pub use torrent::{InfoHash, PieceIndex, TorrentError, TorrentMetadata};

/// Core errors that can bubble up from any Undertow subsystem.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::InvalidTorrentFile { reason } => {
                    format!("Invalid torrent file: {reason}")
                }
                TorrentError::DuplicateTorrent { info_hash } => {
                    format!("Torrent {info_hash} is already in the session")
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                _ => "Transfer error occurred".to_string(),
            },
            UndertowError::Storage(_) => "Storage error occurred".to_string(),
            UndertowError::Configuration { .. } => "Configuration error occurred".to_string(),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_message_for_duplicate() {
        let error = UndertowError::Torrent(TorrentError::DuplicateTorrent {
            info_hash: InfoHash::new([0xAB; 20]),
        });
        assert!(error.user_message().contains("already in the session"));
    }
}
