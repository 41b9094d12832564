//! Command definitions and plain-data snapshots for the engine actor model.
//!
//! Each command carries a oneshot responder the actor answers through. The
//! control layer (UI, RPC) consumes the snapshot types as plain data; no
//! presentation formatting happens here.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::oneshot;

use crate::config::SessionLimits;
use crate::torrent::discovery::PeerSource;
use crate::torrent::peer::connection::ConnectionPhase;
use crate::torrent::queue::{QueueMove, SeedPolicy};
use crate::torrent::tracker::TrackerSnapshot;
use crate::torrent::{InfoHash, PieceIndex, TorrentError, TorrentMetadata};

/// Externally observable lifecycle of one torrent.
///
/// `Paused` remembers the state it interrupted and resumes back into it.
#[derive(Debug, Clone, PartialEq)]
pub enum TorrentState {
    QueuedForVerify,
    Verifying,
    QueuedForDownload,
    Downloading,
    QueuedForSeed,
    Seeding,
    Finished,
    Paused { resumes_to: Box<TorrentState> },
    Error { message: String },
}

impl TorrentState {
    /// Terminal states never transition again without operator action.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TorrentState::Finished | TorrentState::Error { .. })
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, TorrentState::Paused { .. })
    }

    /// True while the torrent may exchange data with peers.
    pub fn is_transferring(&self) -> bool {
        matches!(self, TorrentState::Downloading | TorrentState::Seeding)
    }
}

/// Commands accepted by the engine actor.
pub enum EngineCommand {
    /// Add a torrent from raw .torrent bytes.
    AddTorrentData {
        bytes: Vec<u8>,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Add a torrent from a .torrent file on disk.
    AddTorrentFile {
        path: PathBuf,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Add a torrent from a magnet link. The session idles in the download
    /// queue until metadata arrives for the info hash.
    AddMagnet {
        magnet_link: String,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Add pre-parsed metadata directly, or complete a magnet-added torrent.
    AddTorrentMetadata {
        metadata: TorrentMetadata,
        responder: oneshot::Sender<Result<InfoHash, TorrentError>>,
    },
    /// Remove a torrent, optionally deleting its downloaded files.
    Remove {
        info_hash: InfoHash,
        delete_data: bool,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Suspend new I/O, preserving piece and bitmap state.
    Pause {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Resume a paused torrent into the state it paused from.
    Resume {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Re-verify all local data against the piece checksums.
    Verify {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Move the torrent's data to a new download directory.
    SetLocation {
        info_hash: InfoHash,
        path: PathBuf,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Replace the session-wide limits.
    SetLimits {
        limits: SessionLimits,
        responder: oneshot::Sender<()>,
    },
    /// Set per-torrent rate caps.
    SetTorrentLimits {
        info_hash: InfoHash,
        download: Option<u64>,
        upload: Option<u64>,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Set per-torrent seeding stop conditions.
    SetSeedPolicy {
        info_hash: InfoHash,
        policy: SeedPolicy,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Reorder the torrent within the download queue.
    MoveInQueue {
        info_hash: InfoHash,
        direction: QueueMove,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Start downloading immediately, bypassing the queue cap.
    StartNow {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Force an immediate tracker announce ("ask for more peers").
    AskForMorePeers {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Feed peer addresses from a discovery side-channel (DHT, PEX, LPD) or
    /// an incoming connection listener.
    AddPeerCandidates {
        info_hash: InfoHash,
        source: PeerSource,
        addresses: Vec<SocketAddr>,
        responder: oneshot::Sender<Result<usize, TorrentError>>,
    },
    /// Report a received block into the piece store. This is the ingress
    /// peer I/O tasks use; simulations and tests drive it directly.
    DeliverBlock {
        info_hash: InfoHash,
        piece: PieceIndex,
        offset: u32,
        data: Vec<u8>,
        responder: oneshot::Sender<Result<(), TorrentError>>,
    },
    /// Get one torrent's session snapshot.
    GetSession {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<SessionSnapshot, TorrentError>>,
    },
    /// Get every torrent's session snapshot.
    GetSessions {
        responder: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    /// Get per-peer status snapshots for one torrent.
    GetPeers {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<Vec<PeerSnapshot>, TorrentError>>,
    },
    /// Get tracker status snapshots for one torrent.
    GetTrackers {
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<Vec<TrackerSnapshot>, TorrentError>>,
    },
    /// Get engine-wide statistics.
    GetStats {
        responder: oneshot::Sender<EngineStats>,
    },
    /// Shut down the engine actor gracefully.
    Shutdown { responder: oneshot::Sender<()> },
}

/// Plain-data view of one torrent for the control layer.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub info_hash: InfoHash,
    pub name: String,
    pub state: TorrentState,
    pub total_size: u64,
    /// Verified bytes only; never counts unverified blocks.
    pub bytes_have: u64,
    pub bytes_left: u64,
    /// Completion fraction (0.0 to 1.0) over verified data.
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    /// Payload ingress over the last sampling window, bytes per second.
    pub download_rate_bps: u64,
    /// Payload egress over the last sampling window, bytes per second.
    pub upload_rate_bps: u64,
    /// Uploaded as a multiple of the torrent's size.
    pub ratio: f64,
    /// Bytes thrown away after failed checksums.
    pub discarded_bytes: u64,
    pub connected_peers: usize,
    pub known_peers: usize,
    /// Swarm seeder count from the latest announce or scrape, when known.
    pub seeders: Option<u32>,
    /// Swarm leecher count from the latest announce or scrape, when known.
    pub leechers: Option<u32>,
    pub queue_position: Option<usize>,
    pub private: bool,
    pub last_error: Option<String>,
}

/// Plain-data view of one peer connection.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub address: SocketAddr,
    pub source: PeerSource,
    pub phase: ConnectionPhase,
    pub am_choking: bool,
    pub peer_choking: bool,
    pub am_interested: bool,
    pub peer_interested: bool,
    pub incoming: bool,
    pub encrypted: bool,
    pub is_seed: bool,
    pub partial_seed: bool,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

/// Engine-wide statistics for monitoring.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub torrents: usize,
    pub downloading: usize,
    pub seeding: usize,
    pub connected_peers: usize,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_resumes_to_prior_state() {
        let paused = TorrentState::Paused {
            resumes_to: Box::new(TorrentState::Downloading),
        };
        assert!(paused.is_paused());
        assert!(!paused.is_terminal());

        if let TorrentState::Paused { resumes_to } = paused {
            assert_eq!(*resumes_to, TorrentState::Downloading);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TorrentState::Finished.is_terminal());
        assert!(
            TorrentState::Error {
                message: "disk gone".to_string()
            }
            .is_terminal()
        );
        assert!(!TorrentState::Seeding.is_terminal());
    }
}
