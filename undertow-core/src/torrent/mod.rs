//! Torrent session core: identity types, error taxonomy, and the components
//! that make up a per-torrent session (piece store, peers, discovery,
//! trackers, queue policy).

pub mod discovery;
pub mod parsing;
pub mod peer;
pub mod piece_store;
pub mod queue;
pub mod tracker;

use std::fmt;
use std::net::SocketAddr;

pub use discovery::{CandidatePool, PeerSource};
pub use parsing::{MagnetLink, MetainfoParser, TorrentFile, TorrentMetadata, TorrentParser};
pub use peer::choker::{ChokeCandidate, ChokeDecision, Choker};
pub use peer::connection::{ConnectionPhase, PeerTaskEvent, PeerTaskHandle, PeerWire};
pub use peer::protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
pub use peer::state::{PeerBitfield, PeerSession, PendingBlockRequest};
pub use piece_store::{BlockReceipt, BlockRequest, PieceStore, VerifyOutcome, BLOCK_SIZE};
pub use queue::{QueueMove, SeedPolicy, SessionQueue};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, ScrapeRequest,
    ScrapeResponse, ScrapeStats, TrackerClient, TrackerSnapshot, TrackerStatus, TrackerTier,
};

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Per-peer and per-tracker variants are isolated and retried by their owning
/// tasks; only storage failures and explicit removal are fatal to a torrent.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Failed to parse torrent file: {reason}")]
    InvalidTorrentFile { reason: String },

    #[error("Piece {piece} failed checksum verification")]
    ChecksumFailure { piece: PieceIndex },

    #[error("Protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Handshake from {address} rejected: encryption required")]
    EncryptionPolicyViolation { address: SocketAddr },

    #[error("Tracker unreachable: {url}")]
    TrackerUnreachable { url: String },

    #[error("Tracker request timed out: {url}")]
    TrackerTimeout { url: String },

    #[error("Tracker {url} returned error: {message}")]
    TrackerError { url: String, message: String },

    #[error("Torrent {info_hash} is already in the session")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("Engine has shut down")]
    EngineShutdown,

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("UTF-8 conversion error")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// True when the failure is confined to one peer or tracker and the
    /// torrent itself keeps running.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            TorrentError::Storage(_) | TorrentError::Io(_) | TorrentError::EngineShutdown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
    }

    #[test]
    fn test_transient_classification() {
        let checksum = TorrentError::ChecksumFailure {
            piece: PieceIndex::new(2),
        };
        assert!(checksum.is_transient());

        let io = TorrentError::Io(std::io::Error::other("disk gone"));
        assert!(!io.is_transient());
    }
}
