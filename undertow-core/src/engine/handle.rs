//! Handle for communicating with the engine actor.

use std::net::SocketAddr;
use std::path::PathBuf;

use tokio::sync::{mpsc, oneshot};

use super::commands::{EngineCommand, EngineStats, PeerSnapshot, SessionSnapshot};
use crate::config::SessionLimits;
use crate::torrent::discovery::PeerSource;
use crate::torrent::queue::{QueueMove, SeedPolicy};
use crate::torrent::tracker::TrackerSnapshot;
use crate::torrent::{InfoHash, PieceIndex, TorrentError, TorrentMetadata};

/// Handle for communicating with the engine actor.
///
/// Provides an ergonomic async API for sending commands to the engine actor.
/// Can be cloned and shared across tasks safely; this is the surface the
/// excluded UI/control layer drives.
#[derive(Clone)]
pub struct EngineHandle {
    sender: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    /// Creates a new handle with the given command sender.
    pub(crate) fn new(sender: mpsc::Sender<EngineCommand>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, TorrentError> {
        let (responder, rx) = oneshot::channel();
        self.sender
            .send(make(responder))
            .await
            .map_err(|_| TorrentError::EngineShutdown)?;
        rx.await.map_err(|_| TorrentError::EngineShutdown)
    }

    /// Adds a torrent from raw .torrent bytes.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode
    /// - `TorrentError::DuplicateTorrent` - Torrent already in the session
    pub async fn add_torrent_data(&self, bytes: Vec<u8>) -> Result<InfoHash, TorrentError> {
        self.request(|responder| EngineCommand::AddTorrentData { bytes, responder })
            .await?
    }

    /// Adds a torrent from a .torrent file on disk.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Unreadable file or malformed bencode
    /// - `TorrentError::DuplicateTorrent` - Torrent already in the session
    pub async fn add_torrent_file(&self, path: PathBuf) -> Result<InfoHash, TorrentError> {
        self.request(|responder| EngineCommand::AddTorrentFile { path, responder })
            .await?
    }

    /// Adds a torrent from a magnet link.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentFile` - Malformed magnet URI
    /// - `TorrentError::DuplicateTorrent` - Torrent already in the session
    pub async fn add_magnet(&self, magnet_link: &str) -> Result<InfoHash, TorrentError> {
        let magnet_link = magnet_link.to_string();
        self.request(|responder| EngineCommand::AddMagnet {
            magnet_link,
            responder,
        })
        .await?
    }

    /// Adds pre-parsed metadata, or completes a magnet-added torrent.
    ///
    /// # Errors
    /// - `TorrentError::DuplicateTorrent` - Torrent already has metadata
    pub async fn add_torrent_metadata(
        &self,
        metadata: TorrentMetadata,
    ) -> Result<InfoHash, TorrentError> {
        self.request(|responder| EngineCommand::AddTorrentMetadata {
            metadata,
            responder,
        })
        .await?
    }

    /// Removes a torrent, optionally deleting its downloaded files.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn remove(&self, info_hash: InfoHash, delete_data: bool) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Remove {
            info_hash,
            delete_data,
            responder,
        })
        .await?
    }

    /// Pauses a torrent, suspending new I/O but keeping piece state.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn pause(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Pause {
            info_hash,
            responder,
        })
        .await?
    }

    /// Resumes a paused torrent into the state it paused from.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn resume(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Resume {
            info_hash,
            responder,
        })
        .await?
    }

    /// Re-verifies all local data for a torrent.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn verify(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Verify {
            info_hash,
            responder,
        })
        .await?
    }

    /// Moves a torrent's data to a new download directory.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn set_location(&self, info_hash: InfoHash, path: PathBuf) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::SetLocation {
            info_hash,
            path,
            responder,
        })
        .await?
    }

    /// Replaces the session-wide limits.
    pub async fn set_limits(&self, limits: SessionLimits) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::SetLimits { limits, responder })
            .await
    }

    /// Sets per-torrent rate caps (`None` = ride the global pools).
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn set_torrent_limits(
        &self,
        info_hash: InfoHash,
        download: Option<u64>,
        upload: Option<u64>,
    ) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::SetTorrentLimits {
            info_hash,
            download,
            upload,
            responder,
        })
        .await?
    }

    /// Sets per-torrent seeding stop conditions.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn set_seed_policy(
        &self,
        info_hash: InfoHash,
        policy: SeedPolicy,
    ) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::SetSeedPolicy {
            info_hash,
            policy,
            responder,
        })
        .await?
    }

    /// Reorders a torrent within the download queue.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn move_in_queue(
        &self,
        info_hash: InfoHash,
        direction: QueueMove,
    ) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::MoveInQueue {
            info_hash,
            direction,
            responder,
        })
        .await?
    }

    /// Starts a torrent immediately, bypassing the queue cap.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn start_now(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::StartNow {
            info_hash,
            responder,
        })
        .await?
    }

    /// Forces an immediate tracker announce ("ask for more peers").
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn ask_for_more_peers(&self, info_hash: InfoHash) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::AskForMorePeers {
            info_hash,
            responder,
        })
        .await?
    }

    /// Feeds peer addresses from a discovery side-channel. Returns how many
    /// were new; side-channel candidates for private torrents are dropped.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn add_peer_candidates(
        &self,
        info_hash: InfoHash,
        source: PeerSource,
        addresses: Vec<SocketAddr>,
    ) -> Result<usize, TorrentError> {
        self.request(|responder| EngineCommand::AddPeerCandidates {
            info_hash,
            source,
            addresses,
            responder,
        })
        .await?
    }

    /// Reports a received block into the torrent's piece store.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    /// - `TorrentError::ProtocolViolation` - Block outside the piece layout
    pub async fn deliver_block(
        &self,
        info_hash: InfoHash,
        piece: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::DeliverBlock {
            info_hash,
            piece,
            offset,
            data,
            responder,
        })
        .await?
    }

    /// Gets one torrent's session snapshot.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn session(&self, info_hash: InfoHash) -> Result<SessionSnapshot, TorrentError> {
        self.request(|responder| EngineCommand::GetSession {
            info_hash,
            responder,
        })
        .await?
    }

    /// Gets every torrent's session snapshot.
    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, TorrentError> {
        self.request(|responder| EngineCommand::GetSessions { responder })
            .await
    }

    /// Gets per-peer status snapshots for a torrent.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn peers(&self, info_hash: InfoHash) -> Result<Vec<PeerSnapshot>, TorrentError> {
        self.request(|responder| EngineCommand::GetPeers {
            info_hash,
            responder,
        })
        .await?
    }

    /// Gets tracker status snapshots for a torrent.
    ///
    /// # Errors
    /// - `TorrentError::TorrentNotFound` - Info hash not in the session
    pub async fn trackers(&self, info_hash: InfoHash) -> Result<Vec<TrackerSnapshot>, TorrentError> {
        self.request(|responder| EngineCommand::GetTrackers {
            info_hash,
            responder,
        })
        .await?
    }

    /// Gets engine-wide statistics.
    pub async fn stats(&self) -> Result<EngineStats, TorrentError> {
        self.request(|responder| EngineCommand::GetStats { responder })
            .await
    }

    /// Shuts down the engine actor gracefully.
    pub async fn shutdown(&self) -> Result<(), TorrentError> {
        self.request(|responder| EngineCommand::Shutdown { responder })
            .await
    }

    /// True while the engine actor is accepting commands.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}
