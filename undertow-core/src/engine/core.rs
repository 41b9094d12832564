//! Engine state and orchestration.
//!
//! One `Engine` owns every torrent session: piece stores, peer sets,
//! tracker tiers, the download queue, and the shared bandwidth pools. The
//! actor loop feeds it commands, peer I/O events, internal events from
//! spawned jobs (verification, announces, disk reads), and periodic ticks.
//! All mutation happens on the actor task; spawned jobs only compute and
//! report back.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock, Semaphore};

use super::commands::{EngineStats, PeerSnapshot, SessionSnapshot, TorrentState};
use crate::config::UndertowConfig;
use crate::network::bandwidth::{BandwidthScheduler, Direction};
use crate::storage::{FileStorage, Storage};
use crate::torrent::discovery::{CandidatePool, PeerSource};
use crate::torrent::peer::connection::{
    spawn_peer_task, ConnectionPhase, PeerTaskEvent, PeerTaskHandle,
};
use crate::torrent::peer::{
    ChokeCandidate, ChokeDecision, Choker, PeerId, PeerMessage, PeerSession,
};
use crate::torrent::piece_store::{hash_matches, BlockReceipt, PieceStore, VerifyOutcome, BLOCK_SIZE};
use crate::torrent::queue::{QueueMove, SeedPolicy, SessionQueue};
use crate::torrent::tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, ScrapeRequest,
    ScrapeResponse, TrackerClient, TrackerSnapshot, TrackerTier,
};
use crate::torrent::{
    InfoHash, MagnetLink, MetainfoParser, PieceIndex, TorrentError, TorrentMetadata, TorrentParser,
};

/// Upload slot reallocation cadence.
const RECHOKE_INTERVAL: Duration = Duration::from_secs(10);

/// Internal events reported back by spawned jobs.
pub(crate) enum EngineEvent {
    /// Initial or operator-requested verify scan finished.
    ScanComplete {
        info_hash: InfoHash,
        generation: u64,
        verified: Vec<u32>,
        error: Option<String>,
    },
    /// A downloaded piece finished hashing (and writing, when it matched).
    PieceVerified {
        info_hash: InfoHash,
        piece: PieceIndex,
        matched: bool,
        write_error: Option<String>,
    },
    /// A tracker announce round-trip completed.
    AnnounceOutcome {
        info_hash: InfoHash,
        tier: usize,
        result: Result<AnnounceResponse, TorrentError>,
    },
    /// A tracker scrape round-trip completed.
    ScrapeOutcome {
        info_hash: InfoHash,
        result: Result<ScrapeResponse, TorrentError>,
    },
    /// A block was read from disk for upload to a peer.
    BlockReadForUpload {
        info_hash: InfoHash,
        address: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        result: Result<Option<Vec<u8>>, String>,
    },
    /// Data relocation finished.
    RelocateOutcome {
        info_hash: InfoHash,
        error: Option<String>,
    },
}

/// One peer connection slot: the I/O task plus, once the handshake lands,
/// the protocol session state.
struct PeerEntry {
    task: PeerTaskHandle,
    session: Option<PeerSession>,
}

/// Everything the engine holds for one torrent.
struct TorrentEntry {
    metadata: TorrentMetadata,
    /// False for magnet-added torrents still waiting for their piece layout.
    has_metadata: bool,
    state: TorrentState,
    pieces: PieceStore,
    storage: Arc<RwLock<FileStorage>>,
    candidates: CandidatePool,
    trackers: Vec<TrackerTier>,
    peers: HashMap<SocketAddr, PeerEntry>,
    choker: Choker,
    seed_policy: SeedPolicy,
    bytes_downloaded: u64,
    bytes_uploaded: u64,
    seeders: Option<u32>,
    leechers: Option<u32>,
    last_error: Option<String>,
    last_data_exchange: Instant,
    last_rechoke: Instant,
    /// Rate sampling reference point and the rates computed from it.
    last_rate_sample: Instant,
    sampled_downloaded: u64,
    sampled_uploaded: u64,
    download_rate_bps: u64,
    upload_rate_bps: u64,
    announced_started: bool,
    /// Event to attach to the next announce (started/completed/stopped).
    pending_event: Option<AnnounceEvent>,
    /// Discriminates stale verify-scan results after a re-verify.
    scan_generation: u64,
}

impl TorrentEntry {
    fn new(metadata: TorrentMetadata, has_metadata: bool, config: &UndertowConfig) -> Self {
        let pieces = PieceStore::new(
            metadata.piece_length.max(1),
            metadata.total_length,
            metadata.piece_hashes.clone(),
            rand::random(),
        );
        let storage = Arc::new(RwLock::new(FileStorage::new(
            config.storage.download_dir.clone(),
            &metadata,
        )));
        let trackers = metadata
            .announce_tiers
            .iter()
            .map(|tier| {
                TrackerTier::new(
                    tier.clone(),
                    config.network.min_announce_interval,
                    config.network.max_announce_interval,
                )
            })
            .collect();
        let candidates = CandidatePool::new(metadata.private);
        let state = if has_metadata {
            TorrentState::QueuedForVerify
        } else {
            TorrentState::QueuedForDownload
        };

        Self {
            candidates,
            trackers,
            pieces,
            storage,
            has_metadata,
            state,
            peers: HashMap::new(),
            choker: Choker::new(config.limits.upload_slots, rand::random()),
            seed_policy: SeedPolicy::default(),
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            seeders: None,
            leechers: None,
            last_error: None,
            last_data_exchange: Instant::now(),
            last_rechoke: Instant::now(),
            last_rate_sample: Instant::now(),
            sampled_downloaded: 0,
            sampled_uploaded: 0,
            download_rate_bps: 0,
            upload_rate_bps: 0,
            announced_started: false,
            pending_event: None,
            scan_generation: 0,
            metadata,
        }
    }

    /// Uploaded bytes as a multiple of the torrent's size.
    fn ratio(&self) -> f64 {
        if self.metadata.total_length > 0 {
            self.bytes_uploaded as f64 / self.metadata.total_length as f64
        } else {
            0.0
        }
    }

    /// Sets the next lifecycle state, preserving a pause wrapper.
    fn transition(&mut self, next: TorrentState) {
        if self.state.is_paused() {
            self.state = TorrentState::Paused {
                resumes_to: Box::new(next),
            };
        } else {
            self.state = next;
        }
    }
}

/// The torrent session engine.
pub struct Engine {
    config: UndertowConfig,
    peer_id: PeerId,
    bandwidth: Arc<BandwidthScheduler>,
    queue: SessionQueue,
    torrents: HashMap<InfoHash, TorrentEntry>,
    verify_slots: Arc<Semaphore>,
    parser: MetainfoParser,
    events: mpsc::UnboundedSender<EngineEvent>,
    peer_events: mpsc::UnboundedSender<PeerTaskEvent>,
}

impl Engine {
    /// Creates the engine. `events` and `peer_events` are the channels the
    /// actor loop drains back into `handle_event`/`handle_peer_event`.
    pub(crate) fn new(
        config: UndertowConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
        peer_events: mpsc::UnboundedSender<PeerTaskEvent>,
    ) -> Self {
        let bandwidth = Arc::new(BandwidthScheduler::new(config.limits.clone()));
        let queue = SessionQueue::new(config.limits.max_active_downloads);
        let verify_slots = Arc::new(Semaphore::new(config.torrent.verify_workers.max(1)));

        Self {
            peer_id: PeerId::generate(),
            bandwidth,
            queue,
            torrents: HashMap::new(),
            verify_slots,
            parser: MetainfoParser::new(),
            events,
            peer_events,
            config,
        }
    }

    /// Shared bandwidth scheduler, e.g. for diagnostics.
    pub fn bandwidth(&self) -> Arc<BandwidthScheduler> {
        self.bandwidth.clone()
    }

    // ----- torrent lifecycle commands -----

    pub(crate) async fn add_torrent_data(&mut self, bytes: &[u8]) -> Result<InfoHash, TorrentError> {
        let metadata = self.parser.parse_torrent_data(bytes).await?;
        self.add_torrent_metadata(metadata)
    }

    pub(crate) async fn add_torrent_file(
        &mut self,
        path: &std::path::Path,
    ) -> Result<InfoHash, TorrentError> {
        let metadata = self.parser.parse_torrent_file(path).await?;
        self.add_torrent_metadata(metadata)
    }

    pub(crate) async fn add_magnet(&mut self, magnet_link: &str) -> Result<InfoHash, TorrentError> {
        let magnet = self.parser.parse_magnet_link(magnet_link).await?;
        let info_hash = magnet.info_hash;
        if self.torrents.contains_key(&info_hash) {
            return Err(TorrentError::DuplicateTorrent { info_hash });
        }

        let metadata = Self::placeholder_metadata(magnet);
        let entry = TorrentEntry::new(metadata, false, &self.config);
        // Not enqueued: without a piece layout there is nothing to download.
        self.torrents.insert(info_hash, entry);
        tracing::info!("added magnet {info_hash}, waiting for metadata");
        Ok(info_hash)
    }

    /// Registers parsed metadata, or completes a magnet-added torrent whose
    /// metadata just arrived.
    pub(crate) fn add_torrent_metadata(
        &mut self,
        metadata: TorrentMetadata,
    ) -> Result<InfoHash, TorrentError> {
        let info_hash = metadata.info_hash;

        if let Some(existing) = self.torrents.get_mut(&info_hash) {
            if existing.has_metadata {
                return Err(TorrentError::DuplicateTorrent { info_hash });
            }
            // Magnet shell: swap in the real layout and verify from scratch.
            let mut upgraded = TorrentEntry::new(metadata, true, &self.config);
            upgraded.bytes_downloaded = existing.bytes_downloaded;
            upgraded.bytes_uploaded = existing.bytes_uploaded;
            *existing = upgraded;
            self.begin_scan(info_hash);
            return Ok(info_hash);
        }

        let entry = TorrentEntry::new(metadata, true, &self.config);
        self.torrents.insert(info_hash, entry);
        self.begin_scan(info_hash);
        tracing::info!("added torrent {info_hash}");
        Ok(info_hash)
    }

    fn placeholder_metadata(magnet: MagnetLink) -> TorrentMetadata {
        let name = magnet
            .display_name
            .unwrap_or_else(|| format!("magnet-{}", magnet.info_hash));
        TorrentMetadata {
            info_hash: magnet.info_hash,
            name,
            piece_length: BLOCK_SIZE,
            piece_hashes: Vec::new(),
            total_length: 0,
            files: Vec::new(),
            announce_tiers: magnet.trackers.into_iter().map(|url| vec![url]).collect(),
            private: false,
            comment: None,
            created_by: None,
            creation_date: None,
        }
    }

    pub(crate) fn remove(&mut self, info_hash: InfoHash, delete_data: bool) -> Result<(), TorrentError> {
        let Some(mut entry) = self.torrents.remove(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };

        Self::close_all_peers(&mut entry);
        self.queue.remove(info_hash);
        self.bandwidth.remove_torrent(info_hash);
        self.spawn_stop_announce(&mut entry, info_hash);

        if delete_data {
            let storage = entry.storage.clone();
            tokio::spawn(async move {
                if let Err(e) = storage.read().await.remove_data().await {
                    tracing::warn!("failed to delete data for {info_hash}: {e}");
                }
            });
        }

        tracing::info!("removed torrent {info_hash}");
        Ok(())
    }

    pub(crate) fn pause(&mut self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };
        if entry.state.is_terminal() || entry.state.is_paused() {
            return Ok(());
        }

        Self::close_all_peers(entry);
        // A paused download resumes through the queue, not straight to a slot.
        let resumes_to = match entry.state.clone() {
            TorrentState::Downloading => TorrentState::QueuedForDownload,
            other => other,
        };
        entry.state = TorrentState::Paused {
            resumes_to: Box::new(resumes_to),
        };
        self.queue.remove(info_hash);
        self.spawn_stop_announce_at(info_hash);
        Ok(())
    }

    pub(crate) fn resume(&mut self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };
        let TorrentState::Paused { resumes_to } = entry.state.clone() else {
            return Ok(());
        };

        entry.state = *resumes_to;
        entry.announced_started = false;
        if entry.state == TorrentState::QueuedForDownload {
            self.queue.enqueue(info_hash);
        }
        if entry.state == TorrentState::Verifying {
            self.begin_scan(info_hash);
        }
        Ok(())
    }

    /// Operator-requested full re-verification of local data.
    pub(crate) fn verify(&mut self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };
        if !entry.has_metadata {
            return Ok(());
        }

        // Fresh piece state; re-apply the bitfields of peers still connected.
        entry.pieces = PieceStore::new(
            entry.metadata.piece_length.max(1),
            entry.metadata.total_length,
            entry.metadata.piece_hashes.clone(),
            rand::random(),
        );
        for peer in entry.peers.values() {
            if let Some(bits) = peer.session.as_ref().and_then(|s| s.peer_pieces()) {
                entry.pieces.apply_peer_bitfield(bits);
            }
        }
        self.queue.remove(info_hash);
        self.begin_scan(info_hash);
        Ok(())
    }

    pub(crate) fn set_location(&mut self, info_hash: InfoHash, path: PathBuf) -> Result<(), TorrentError> {
        let events = self.events.clone();
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };
        let storage = entry.storage.clone();
        tokio::spawn(async move {
            let error = storage
                .write()
                .await
                .relocate(&path)
                .await
                .err()
                .map(|e| e.to_string());
            let _ = events.send(EngineEvent::RelocateOutcome { info_hash, error });
        });
        Ok(())
    }

    pub(crate) fn set_limits(&mut self, limits: crate::config::SessionLimits) {
        self.queue.set_max_active_downloads(limits.max_active_downloads);
        self.bandwidth.set_limits(limits.clone());
        self.config.limits = limits;
    }

    pub(crate) fn set_torrent_limits(
        &mut self,
        info_hash: InfoHash,
        download: Option<u64>,
        upload: Option<u64>,
    ) -> Result<(), TorrentError> {
        if !self.torrents.contains_key(&info_hash) {
            return Err(TorrentError::TorrentNotFound { info_hash });
        }
        self.bandwidth.set_torrent_limits(info_hash, download, upload);
        Ok(())
    }

    pub(crate) fn set_seed_policy(
        &mut self,
        info_hash: InfoHash,
        policy: SeedPolicy,
    ) -> Result<(), TorrentError> {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };
        entry.seed_policy = policy;
        Ok(())
    }

    pub(crate) fn move_in_queue(
        &mut self,
        info_hash: InfoHash,
        direction: QueueMove,
    ) -> Result<(), TorrentError> {
        if !self.torrents.contains_key(&info_hash) {
            return Err(TorrentError::TorrentNotFound { info_hash });
        }
        self.queue.reorder(info_hash, direction);
        Ok(())
    }

    pub(crate) fn start_now(&mut self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };
        self.queue.start_now(info_hash);
        if entry.state == TorrentState::QueuedForDownload && entry.has_metadata {
            entry.state = TorrentState::Downloading;
            if !entry.announced_started {
                entry.announced_started = true;
                entry.pending_event = Some(AnnounceEvent::Started);
                let now = Instant::now();
                for tier in &mut entry.trackers {
                    tier.force_announce(now);
                }
            }
        }
        Ok(())
    }

    /// "Ask for more peers": force an immediate announce on every tier.
    pub(crate) fn ask_for_more_peers(&mut self, info_hash: InfoHash) -> Result<(), TorrentError> {
        let now = Instant::now();
        let due: Vec<usize> = {
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                return Err(TorrentError::TorrentNotFound { info_hash });
            };
            for tier in &mut entry.trackers {
                tier.force_announce(now);
            }
            (0..entry.trackers.len())
                .filter(|&i| entry.trackers[i].announce_due(now))
                .collect()
        };
        for tier in due {
            self.spawn_announce(info_hash, tier);
        }
        Ok(())
    }

    pub(crate) fn add_peer_candidates(
        &mut self,
        info_hash: InfoHash,
        source: PeerSource,
        addresses: Vec<SocketAddr>,
    ) -> Result<usize, TorrentError> {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };
        Ok(entry.candidates.add_candidates(source, addresses))
    }

    // ----- block ingress and verification -----

    /// Feeds a received block into the torrent's piece store; complete
    /// pieces go to the bounded verify pool.
    pub(crate) fn handle_block(
        &mut self,
        info_hash: InfoHash,
        piece: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<(), TorrentError> {
        let events = self.events.clone();
        let slots = self.verify_slots.clone();
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return Err(TorrentError::TorrentNotFound { info_hash });
        };

        match entry.pieces.mark_block_received(piece, offset, &data)? {
            BlockReceipt::Ignored => {}
            BlockReceipt::Accepted => {
                entry.bytes_downloaded += data.len() as u64;
                entry.last_data_exchange = Instant::now();
            }
            BlockReceipt::PieceComplete(bytes) => {
                entry.bytes_downloaded += data.len() as u64;
                entry.last_data_exchange = Instant::now();

                let Some(expected) = entry.pieces.expected_hash(piece) else {
                    return Ok(());
                };
                let storage = entry.storage.clone();
                tokio::spawn(async move {
                    let Ok(_permit) = slots.acquire().await else {
                        return;
                    };
                    let hashed = bytes.clone();
                    let matched =
                        tokio::task::spawn_blocking(move || hash_matches(&expected, &hashed))
                            .await
                            .unwrap_or(false);

                    let mut write_error = None;
                    if matched {
                        if let Err(e) = storage.read().await.write_piece(piece, &bytes).await {
                            write_error = Some(e.to_string());
                        }
                    }
                    let _ = events.send(EngineEvent::PieceVerified {
                        info_hash,
                        piece,
                        matched,
                        write_error,
                    });
                });
            }
        }
        Ok(())
    }

    /// Spawns the verify scan of on-disk data for a torrent.
    fn begin_scan(&mut self, info_hash: InfoHash) {
        let events = self.events.clone();
        let slots = self.verify_slots.clone();
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };

        entry.scan_generation += 1;
        entry.transition(TorrentState::Verifying);
        let generation = entry.scan_generation;
        let storage = entry.storage.clone();
        let hashes = entry.metadata.piece_hashes.clone();

        tokio::spawn(async move {
            let mut verified = Vec::new();
            let mut error = None;

            for (index, expected) in hashes.iter().enumerate() {
                let piece = PieceIndex::new(index as u32);
                match storage.read().await.read_piece(piece).await {
                    Ok(Some(bytes)) => {
                        let Ok(_permit) = slots.acquire().await else {
                            return;
                        };
                        let expected = *expected;
                        let matched =
                            tokio::task::spawn_blocking(move || hash_matches(&expected, &bytes))
                                .await
                                .unwrap_or(false);
                        if matched {
                            verified.push(index as u32);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error = Some(e.to_string());
                        break;
                    }
                }
            }

            let _ = events.send(EngineEvent::ScanComplete {
                info_hash,
                generation,
                verified,
                error,
            });
        });
    }

    // ----- internal event handling -----

    pub(crate) fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::ScanComplete {
                info_hash,
                generation,
                verified,
                error,
            } => self.on_scan_complete(info_hash, generation, verified, error),
            EngineEvent::PieceVerified {
                info_hash,
                piece,
                matched,
                write_error,
            } => self.on_piece_verified(info_hash, piece, matched, write_error),
            EngineEvent::AnnounceOutcome {
                info_hash,
                tier,
                result,
            } => self.on_announce_outcome(info_hash, tier, result),
            EngineEvent::ScrapeOutcome { info_hash, result } => {
                self.on_scrape_outcome(info_hash, result)
            }
            EngineEvent::BlockReadForUpload {
                info_hash,
                address,
                piece,
                offset,
                result,
            } => self.on_block_read(info_hash, address, piece, offset, result),
            EngineEvent::RelocateOutcome { info_hash, error } => {
                if let Some(message) = error {
                    self.fail_torrent(info_hash, format!("relocation failed: {message}"));
                }
            }
        }
    }

    fn on_scan_complete(
        &mut self,
        info_hash: InfoHash,
        generation: u64,
        verified: Vec<u32>,
        error: Option<String>,
    ) {
        if let Some(message) = error {
            self.fail_torrent(info_hash, message);
            return;
        }
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        if entry.scan_generation != generation {
            return; // superseded by a newer verify
        }

        for piece in verified {
            entry.pieces.mark_piece_verified(PieceIndex::new(piece));
        }

        let next = if entry.pieces.is_complete() && entry.pieces.piece_count() > 0 {
            TorrentState::QueuedForSeed
        } else {
            TorrentState::QueuedForDownload
        };
        tracing::debug!(
            "verify scan of {info_hash} done: {}/{} pieces present",
            entry.pieces.have_bitfield().count_set(),
            entry.pieces.piece_count()
        );
        entry.transition(next);
        if entry.state == TorrentState::QueuedForDownload {
            self.queue.enqueue(info_hash);
        }
    }

    fn on_piece_verified(
        &mut self,
        info_hash: InfoHash,
        piece: PieceIndex,
        matched: bool,
        write_error: Option<String>,
    ) {
        let outcome = {
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                return;
            };
            entry.pieces.record_verify_result(piece, matched)
        };

        match outcome {
            VerifyOutcome::Verified => {
                if let Some(message) = write_error {
                    self.fail_torrent(info_hash, message);
                    return;
                }
                self.on_piece_won(info_hash, piece);
            }
            VerifyOutcome::Failed => {
                let Some(entry) = self.torrents.get_mut(&info_hash) else {
                    return;
                };
                tracing::warn!(
                    "piece {piece} of {info_hash} discarded after failed checksum ({} bytes total)",
                    entry.pieces.discarded_bytes()
                );
                entry.last_error =
                    Some(format!("Piece {piece} discarded after failed checksum"));
            }
        }
    }

    /// A piece verified and persisted: advertise it, drop stale interest,
    /// and move to seeding when the torrent completed.
    fn on_piece_won(&mut self, info_hash: InfoHash, piece: PieceIndex) {
        let completed = {
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                return;
            };

            let TorrentEntry { peers, pieces, .. } = &mut *entry;
            for peer in peers.values_mut() {
                if peer.session.is_none() {
                    continue;
                }
                let _ = peer.task.send(PeerMessage::Have { piece_index: piece });
                let Some(session) = peer.session.as_mut() else {
                    continue;
                };
                if session.am_interested() {
                    let still_wanted = session
                        .peer_pieces()
                        .map(|bits| pieces.wants_any(bits))
                        .unwrap_or(false);
                    if !still_wanted {
                        session.set_am_interested(false);
                        let _ = peer.task.send(PeerMessage::NotInterested);
                    }
                }
            }
            entry.pieces.is_complete()
        };

        if completed {
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                return;
            };
            tracing::info!("torrent {info_hash} download complete");
            entry.pending_event = Some(AnnounceEvent::Completed);
            let now = Instant::now();
            for tier in &mut entry.trackers {
                tier.force_announce(now);
            }
            entry.transition(TorrentState::QueuedForSeed);
            self.queue.remove(info_hash);
        }
    }

    fn on_announce_outcome(
        &mut self,
        info_hash: InfoHash,
        tier: usize,
        result: Result<AnnounceResponse, TorrentError>,
    ) {
        let now = Instant::now();
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let Some(tier_state) = entry.trackers.get_mut(tier) else {
            return;
        };

        match result {
            Ok(response) => {
                tier_state.record_success(now, response.interval, response.warning.clone());
                entry.seeders = Some(response.complete);
                entry.leechers = Some(response.incomplete);
                let added = entry
                    .candidates
                    .add_candidates(PeerSource::Tracker, response.peers.iter().copied());
                if added > 0 {
                    tracing::debug!("tracker gave {added} new peers for {info_hash}");
                }
            }
            Err(
                error @ (TorrentError::TrackerTimeout { .. }
                | TorrentError::TrackerUnreachable { .. }),
            ) => {
                tier_state.record_timeout(now);
                entry.last_error = Some(error.to_string());
            }
            Err(TorrentError::TrackerError { url, message }) => {
                tier_state.record_error(now, message.clone());
                entry.last_error = Some(format!("Tracker {url}: {message}"));
            }
            Err(other) => {
                tier_state.record_error(now, other.to_string());
                entry.last_error = Some(other.to_string());
            }
        }
    }

    fn on_scrape_outcome(&mut self, info_hash: InfoHash, result: Result<ScrapeResponse, TorrentError>) {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        match result {
            Ok(response) => {
                if let Some(stats) = response.files.get(&info_hash) {
                    entry.seeders = Some(stats.complete);
                    entry.leechers = Some(stats.incomplete);
                }
            }
            Err(error) => {
                tracing::debug!("scrape for {info_hash} failed: {error}");
            }
        }
    }

    fn on_block_read(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        result: Result<Option<Vec<u8>>, String>,
    ) {
        let data = match result {
            Ok(Some(data)) => data,
            Ok(None) => return,
            Err(message) => {
                self.fail_torrent(info_hash, format!("upload read failed: {message}"));
                return;
            }
        };

        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let Some(peer) = entry.peers.get_mut(&address) else {
            return;
        };
        let Some(session) = peer.session.as_mut() else {
            return;
        };
        if session.am_choking() {
            return; // choked while the read was in flight
        }

        let length = data.len() as u64;
        let _ = peer.task.send(PeerMessage::Piece {
            piece_index: piece,
            offset,
            data: bytes::Bytes::from(data),
        });
        session.record_block_uploaded(length);
        entry.bytes_uploaded += length;
        entry.last_data_exchange = Instant::now();
    }

    // ----- peer event handling -----

    pub(crate) fn handle_peer_event(&mut self, event: PeerTaskEvent) {
        match event {
            PeerTaskEvent::Connected {
                info_hash,
                address,
                encrypted,
            } => self.on_peer_connected(info_hash, address, encrypted),
            PeerTaskEvent::ConnectFailed {
                info_hash,
                address,
                error,
            } => self.on_peer_connect_failed(info_hash, address, error),
            PeerTaskEvent::Message {
                info_hash,
                address,
                message,
            } => self.on_peer_message(info_hash, address, message),
            PeerTaskEvent::Closed {
                info_hash,
                address,
                reason,
            } => {
                if let Some(entry) = self.torrents.get_mut(&info_hash) {
                    Self::drop_peer(entry, address, &reason);
                }
            }
        }
    }

    fn on_peer_connected(&mut self, info_hash: InfoHash, address: SocketAddr, encrypted: bool) {
        let pipeline_depth = self.config.torrent.request_pipeline_depth;
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        entry.candidates.mark_connected(address);
        let source = entry
            .candidates
            .source_of(address)
            .unwrap_or(PeerSource::Tracker);

        let have = entry.pieces.have_bitfield();
        let Some(peer) = entry.peers.get_mut(&address) else {
            return;
        };
        peer.session = Some(PeerSession::new(
            address,
            source,
            false,
            encrypted,
            pipeline_depth,
        ));
        if have.count_set() > 0 {
            let _ = peer.task.send(PeerMessage::Bitfield {
                bitfield: have.as_bytes(),
            });
        }
        tracing::debug!(
            "peer {address} connected for {info_hash} (encrypted: {encrypted})"
        );
    }

    fn on_peer_connect_failed(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        error: TorrentError,
    ) {
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        entry.peers.remove(&address);
        match error {
            TorrentError::EncryptionPolicyViolation { .. } => {
                // A plaintext-only peer will not change its mind; forget it.
                tracing::info!("rejected plaintext peer {address} (encryption required)");
                entry.candidates.remove(address);
            }
            _ => entry.candidates.mark_failed(address),
        }
    }

    fn on_peer_message(&mut self, info_hash: InfoHash, address: SocketAddr, message: PeerMessage) {
        match message {
            PeerMessage::Choke => {
                let Some(entry) = self.torrents.get_mut(&info_hash) else {
                    return;
                };
                let TorrentEntry { peers, pieces, .. } = &mut *entry;
                if let Some(session) = peers.get_mut(&address).and_then(|p| p.session.as_mut()) {
                    for request in session.record_peer_choked() {
                        pieces.release_request(&request);
                    }
                }
            }
            PeerMessage::Unchoke => {
                if let Some(session) = self.session_mut(info_hash, address) {
                    session.record_peer_unchoked();
                }
            }
            PeerMessage::Interested => {
                if let Some(session) = self.session_mut(info_hash, address) {
                    session.record_peer_interested();
                }
            }
            PeerMessage::NotInterested => {
                if let Some(session) = self.session_mut(info_hash, address) {
                    session.record_peer_not_interested();
                }
            }
            PeerMessage::Have { piece_index } => {
                let Some(entry) = self.torrents.get_mut(&info_hash) else {
                    return;
                };
                let piece_count = entry.metadata.piece_count();
                entry.pieces.peer_has_piece(piece_index);
                let wants = entry.pieces.wants_piece(piece_index);
                let Some(peer) = entry.peers.get_mut(&address) else {
                    return;
                };
                let Some(session) = peer.session.as_mut() else {
                    return;
                };
                session.record_have(piece_index, piece_count);
                if wants && !session.am_interested() {
                    session.set_am_interested(true);
                    let _ = peer.task.send(PeerMessage::Interested);
                }
            }
            PeerMessage::Bitfield { bitfield } => {
                let Some(entry) = self.torrents.get_mut(&info_hash) else {
                    return;
                };
                let piece_count = entry.metadata.piece_count();
                let recorded = {
                    let Some(session) = entry
                        .peers
                        .get_mut(&address)
                        .and_then(|p| p.session.as_mut())
                    else {
                        return;
                    };
                    session.record_bitfield(bitfield, piece_count)
                };
                if let Err(violation) = recorded {
                    tracing::debug!("peer {address} sent bad bitfield: {violation}");
                    Self::drop_peer(entry, address, "protocol violation");
                    return;
                }

                let TorrentEntry { peers, pieces, .. } = &mut *entry;
                let Some(peer) = peers.get_mut(&address) else {
                    return;
                };
                let Some(session) = peer.session.as_mut() else {
                    return;
                };
                if let Some(bits) = session.peer_pieces() {
                    pieces.apply_peer_bitfield(bits);
                    if pieces.wants_any(bits) && !session.am_interested() {
                        session.set_am_interested(true);
                        let _ = peer.task.send(PeerMessage::Interested);
                    }
                }
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.on_upload_request(info_hash, address, piece_index, offset, length),
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                {
                    let Some(session) = self.session_mut(info_hash, address) else {
                        return;
                    };
                    session.complete_request(piece_index, offset);
                }
                if let Err(error) = self.handle_block(info_hash, piece_index, offset, data.to_vec())
                {
                    if matches!(error, TorrentError::ProtocolViolation { .. }) {
                        if let Some(entry) = self.torrents.get_mut(&info_hash) {
                            Self::drop_peer(entry, address, "protocol violation");
                        }
                    }
                }
            }
            PeerMessage::Cancel { .. } | PeerMessage::KeepAlive | PeerMessage::Port { .. } => {}
        }
    }

    fn on_upload_request(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
        piece: PieceIndex,
        offset: u32,
        length: u32,
    ) {
        let events = self.events.clone();
        let bandwidth = self.bandwidth.clone();
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };

        if length > 2 * BLOCK_SIZE {
            tracing::debug!("peer {address} requested oversized block ({length} bytes)");
            Self::drop_peer(entry, address, "oversized block request");
            return;
        }
        if !entry.pieces.is_verified(piece) {
            return; // never serve unverified data
        }
        let Some(session) = entry.peers.get(&address).and_then(|p| p.session.as_ref()) else {
            return;
        };
        if session.am_choking() {
            return; // requests from choked peers are ignored
        }

        let granted = bandwidth.request_quota(info_hash, Direction::Upload, length as u64);
        if granted < length as u64 {
            return; // out of upload quota this tick; the peer will re-request
        }

        let storage = entry.storage.clone();
        tokio::spawn(async move {
            let result = storage
                .read()
                .await
                .read_block(piece, offset, length)
                .await
                .map_err(|e| e.to_string());
            let _ = events.send(EngineEvent::BlockReadForUpload {
                info_hash,
                address,
                piece,
                offset,
                result,
            });
        });
    }

    fn session_mut(
        &mut self,
        info_hash: InfoHash,
        address: SocketAddr,
    ) -> Option<&mut PeerSession> {
        self.torrents
            .get_mut(&info_hash)?
            .peers
            .get_mut(&address)?
            .session
            .as_mut()
    }

    // ----- periodic tick -----

    pub(crate) fn handle_tick(&mut self) {
        let now = Instant::now();
        self.promote_queue();
        self.drive_trackers(now);
        self.dial_candidates();
        self.drive_transfers(now);
        self.enforce_seed_limits(now);
        self.sample_rates(now);
    }

    /// Refreshes per-torrent transfer rates from the byte counters.
    fn sample_rates(&mut self, now: Instant) {
        for entry in self.torrents.values_mut() {
            let elapsed = now.duration_since(entry.last_rate_sample);
            if elapsed < Duration::from_secs(1) {
                continue;
            }
            let secs = elapsed.as_secs_f64();
            entry.download_rate_bps =
                ((entry.bytes_downloaded - entry.sampled_downloaded) as f64 / secs) as u64;
            entry.upload_rate_bps =
                ((entry.bytes_uploaded - entry.sampled_uploaded) as f64 / secs) as u64;
            entry.sampled_downloaded = entry.bytes_downloaded;
            entry.sampled_uploaded = entry.bytes_uploaded;
            entry.last_rate_sample = now;
        }
    }

    /// Grants freed download slots in queue order and promotes finished
    /// downloads into seeding.
    fn promote_queue(&mut self) {
        let waiting: Vec<InfoHash> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.state == TorrentState::QueuedForDownload && e.has_metadata)
            .map(|(h, _)| *h)
            .collect();

        for info_hash in waiting {
            if !self.queue.may_activate(info_hash) {
                continue;
            }
            self.queue.activate(info_hash);
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                continue;
            };
            entry.state = TorrentState::Downloading;
            tracing::info!("torrent {info_hash} downloading");
            if !entry.announced_started {
                entry.announced_started = true;
                entry.pending_event = Some(AnnounceEvent::Started);
                let now = Instant::now();
                for tier in &mut entry.trackers {
                    tier.force_announce(now);
                }
            }
        }

        let seeding: Vec<InfoHash> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.state == TorrentState::QueuedForSeed)
            .map(|(h, _)| *h)
            .collect();
        for info_hash in seeding {
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                continue;
            };
            entry.state = TorrentState::Seeding;
            tracing::info!("torrent {info_hash} seeding");
            if !entry.announced_started {
                entry.announced_started = true;
                entry.pending_event = Some(AnnounceEvent::Started);
                let now = Instant::now();
                for tier in &mut entry.trackers {
                    tier.force_announce(now);
                }
            }
        }
    }

    fn drive_trackers(&mut self, now: Instant) {
        let transferring: Vec<InfoHash> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.state.is_transferring())
            .map(|(h, _)| *h)
            .collect();

        for info_hash in transferring {
            let (due, scrape_due) = {
                let Some(entry) = self.torrents.get_mut(&info_hash) else {
                    continue;
                };
                let due: Vec<usize> = (0..entry.trackers.len())
                    .filter(|&i| entry.trackers[i].announce_due(now))
                    .collect();
                let scrape_due = entry
                    .trackers
                    .first()
                    .map(|t| t.scrape_due(now))
                    .unwrap_or(false);
                (due, scrape_due)
            };

            for tier in due {
                self.spawn_announce(info_hash, tier);
            }
            if scrape_due {
                self.spawn_scrape(info_hash);
            }
        }
    }

    fn spawn_announce(&mut self, info_hash: InfoHash, tier_index: usize) {
        let peer_id = *self.peer_id.as_bytes();
        let port = self.config.network.listen_port;
        let network = self.config.network.clone();
        let events = self.events.clone();

        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let Some(tier) = entry.trackers.get_mut(tier_index) else {
            return;
        };
        let Some(url) = tier.begin_announce() else {
            return;
        };

        let request = AnnounceRequest {
            info_hash,
            peer_id,
            port,
            uploaded: entry.bytes_uploaded,
            downloaded: entry.bytes_downloaded,
            left: entry.pieces.bytes_left(),
            event: entry.pending_event.take().unwrap_or(AnnounceEvent::None),
        };

        tokio::spawn(async move {
            let result = match HttpTrackerClient::new(url, &network) {
                Ok(client) => client.announce(request).await,
                Err(error) => Err(error),
            };
            let _ = events.send(EngineEvent::AnnounceOutcome {
                info_hash,
                tier: tier_index,
                result,
            });
        });
    }

    fn spawn_scrape(&mut self, info_hash: InfoHash) {
        let network = self.config.network.clone();
        let events = self.events.clone();
        let now = Instant::now();

        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let Some(tier) = entry.trackers.first_mut() else {
            return;
        };
        let Some(url) = tier.active_url().map(|u| u.to_string()) else {
            return;
        };
        tier.record_scrape(now);

        tokio::spawn(async move {
            let result = match HttpTrackerClient::new(url, &network) {
                Ok(client) => {
                    client
                        .scrape(ScrapeRequest {
                            info_hashes: vec![info_hash],
                        })
                        .await
                }
                Err(error) => Err(error),
            };
            let _ = events.send(EngineEvent::ScrapeOutcome { info_hash, result });
        });
    }

    /// Dials ranked candidates up to the global and per-torrent caps.
    fn dial_candidates(&mut self) {
        let connected: usize = self.torrents.values().map(|e| e.peers.len()).sum();
        let mut budget = self
            .config
            .limits
            .max_peers_global
            .saturating_sub(connected);
        if budget == 0 {
            return;
        }

        let per_torrent_cap = self.config.limits.max_peers_per_torrent;
        let peer_id = self.peer_id;
        let policy = self.config.network.encryption;
        let timeout = self.config.network.peer_connect_timeout;

        let transferring: Vec<InfoHash> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.state.is_transferring())
            .map(|(h, _)| *h)
            .collect();

        for info_hash in transferring {
            if budget == 0 {
                break;
            }
            let peer_events = self.peer_events.clone();
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                continue;
            };
            let slots = per_torrent_cap
                .saturating_sub(entry.peers.len())
                .min(budget);
            for address in entry.candidates.take_candidates(slots) {
                if entry.peers.contains_key(&address) {
                    continue;
                }
                let task = spawn_peer_task(
                    address,
                    info_hash,
                    peer_id,
                    policy,
                    timeout,
                    peer_events.clone(),
                );
                entry.peers.insert(address, PeerEntry { task, session: None });
                budget -= 1;
            }
        }
    }

    /// Per-connection upkeep: expire requests, drop idle peers, refill
    /// request pipelines under the bandwidth scheduler, and rechoke.
    fn drive_transfers(&mut self, now: Instant) {
        let request_timeout = self.config.torrent.request_timeout;
        let idle_timeout = self.config.torrent.peer_idle_timeout;
        let bandwidth = self.bandwidth.clone();

        let hashes: Vec<InfoHash> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.state.is_transferring())
            .map(|(h, _)| *h)
            .collect();

        for info_hash in hashes {
            let Some(entry) = self.torrents.get_mut(&info_hash) else {
                continue;
            };

            // Expired requests go back to the piece store; silent peers go away.
            let mut to_close: Vec<SocketAddr> = Vec::new();
            {
                let TorrentEntry { peers, pieces, .. } = &mut *entry;
                for (address, peer) in peers.iter_mut() {
                    let Some(session) = peer.session.as_mut() else {
                        continue;
                    };
                    for request in session.take_expired_requests(request_timeout) {
                        pieces.release_request(&request);
                    }
                    if session.is_idle(idle_timeout) {
                        to_close.push(*address);
                    }
                }
            }
            for address in to_close {
                Self::drop_peer(entry, address, "idle timeout");
            }

            // Refill request pipelines, gated by download quota.
            if entry.state == TorrentState::Downloading {
                let TorrentEntry { peers, pieces, .. } = &mut *entry;
                for peer in peers.values_mut() {
                    let Some(session) = peer.session.as_mut() else {
                        continue;
                    };
                    if !session.am_interested() {
                        continue;
                    }
                    let capacity = session.request_capacity();
                    if capacity == 0 {
                        continue;
                    }
                    let Some(bits) = session.peer_pieces().cloned() else {
                        continue;
                    };

                    let desired = capacity as u64 * BLOCK_SIZE as u64;
                    let granted = bandwidth.request_quota(info_hash, Direction::Download, desired);
                    let allowed = ((granted / BLOCK_SIZE as u64) as usize).min(capacity);
                    if allowed == 0 {
                        continue;
                    }

                    for request in pieces.select_next_blocks(&bits, allowed) {
                        session.track_request(request);
                        let _ = peer.task.send(PeerMessage::Request {
                            piece_index: request.piece,
                            offset: request.offset,
                            length: request.length,
                        });
                    }
                }
            }

            // Reallocate upload slots.
            if now.duration_since(entry.last_rechoke) >= RECHOKE_INTERVAL {
                entry.last_rechoke = now;
                let candidates: Vec<ChokeCandidate> = entry
                    .peers
                    .iter()
                    .filter_map(|(address, peer)| {
                        peer.session.as_ref().map(|session| ChokeCandidate {
                            address: *address,
                            interested: session.peer_interested(),
                            download_rate: session.bytes_downloaded(),
                            currently_unchoked: !session.am_choking(),
                        })
                    })
                    .collect();

                for decision in entry.choker.rechoke(&candidates) {
                    let (address, choke) = match decision {
                        ChokeDecision::Unchoke(address) => (address, false),
                        ChokeDecision::Choke(address) => (address, true),
                    };
                    if let Some(peer) = entry.peers.get_mut(&address) {
                        if let Some(session) = peer.session.as_mut() {
                            session.set_am_choking(choke);
                        }
                        let _ = peer.task.send(if choke {
                            PeerMessage::Choke
                        } else {
                            PeerMessage::Unchoke
                        });
                    }
                }
            }
        }
    }

    fn enforce_seed_limits(&mut self, now: Instant) {
        let limits = self.config.limits.clone();
        let seeding: Vec<InfoHash> = self
            .torrents
            .iter()
            .filter(|(_, e)| e.state == TorrentState::Seeding)
            .map(|(h, _)| *h)
            .collect();

        for info_hash in seeding {
            let stop = {
                let Some(entry) = self.torrents.get(&info_hash) else {
                    continue;
                };
                let idle = now.duration_since(entry.last_data_exchange);
                entry.seed_policy.should_stop(&limits, entry.ratio(), idle)
            };
            if !stop {
                continue;
            }

            tracing::info!("seeding limits reached for {info_hash}, finishing");
            {
                let Some(entry) = self.torrents.get_mut(&info_hash) else {
                    continue;
                };
                entry.pending_event = Some(AnnounceEvent::Stopped);
                if let Some(tier) = entry.trackers.first_mut() {
                    tier.force_announce(now);
                }
            }
            self.spawn_announce(info_hash, 0);
            if let Some(entry) = self.torrents.get_mut(&info_hash) {
                Self::close_all_peers(entry);
                entry.state = TorrentState::Finished;
            }
            self.queue.remove(info_hash);
        }
    }

    // ----- snapshots -----

    pub(crate) fn session_snapshot(&self, info_hash: InfoHash) -> Result<SessionSnapshot, TorrentError> {
        let entry = self
            .torrents
            .get(&info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;
        Ok(self.snapshot_of(info_hash, entry))
    }

    pub(crate) fn session_snapshots(&self) -> Vec<SessionSnapshot> {
        self.torrents
            .iter()
            .map(|(h, e)| self.snapshot_of(*h, e))
            .collect()
    }

    fn snapshot_of(&self, info_hash: InfoHash, entry: &TorrentEntry) -> SessionSnapshot {
        let total = entry.metadata.total_length;
        let have = entry.pieces.bytes_have();
        SessionSnapshot {
            info_hash,
            name: entry.metadata.name.clone(),
            state: entry.state.clone(),
            total_size: total,
            bytes_have: have,
            bytes_left: entry.pieces.bytes_left(),
            progress: if total > 0 {
                have as f64 / total as f64
            } else {
                0.0
            },
            bytes_downloaded: entry.bytes_downloaded,
            bytes_uploaded: entry.bytes_uploaded,
            download_rate_bps: entry.download_rate_bps,
            upload_rate_bps: entry.upload_rate_bps,
            ratio: entry.ratio(),
            discarded_bytes: entry.pieces.discarded_bytes(),
            connected_peers: entry
                .peers
                .values()
                .filter(|p| p.session.is_some())
                .count(),
            known_peers: entry.candidates.known(),
            seeders: entry.seeders,
            leechers: entry.leechers,
            queue_position: self.queue.position(info_hash),
            private: entry.metadata.private,
            last_error: entry.last_error.clone(),
        }
    }

    pub(crate) fn peer_snapshots(&self, info_hash: InfoHash) -> Result<Vec<PeerSnapshot>, TorrentError> {
        let entry = self
            .torrents
            .get(&info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;

        Ok(entry
            .peers
            .iter()
            .map(|(address, peer)| match &peer.session {
                Some(session) => PeerSnapshot {
                    address: *address,
                    source: session.source(),
                    phase: ConnectionPhase::Established,
                    am_choking: session.am_choking(),
                    peer_choking: session.peer_choking(),
                    am_interested: session.am_interested(),
                    peer_interested: session.peer_interested(),
                    incoming: session.is_incoming(),
                    encrypted: session.is_encrypted(),
                    is_seed: session.is_seed(),
                    partial_seed: session.is_partial_seed(),
                    bytes_downloaded: session.bytes_downloaded(),
                    bytes_uploaded: session.bytes_uploaded(),
                },
                None => PeerSnapshot {
                    address: *address,
                    source: entry
                        .candidates
                        .source_of(*address)
                        .unwrap_or(PeerSource::Tracker),
                    phase: ConnectionPhase::Connecting,
                    am_choking: true,
                    peer_choking: true,
                    am_interested: false,
                    peer_interested: false,
                    incoming: false,
                    encrypted: false,
                    is_seed: false,
                    partial_seed: false,
                    bytes_downloaded: 0,
                    bytes_uploaded: 0,
                },
            })
            .collect())
    }

    pub(crate) fn tracker_snapshots(&self, info_hash: InfoHash) -> Result<Vec<TrackerSnapshot>, TorrentError> {
        let entry = self
            .torrents
            .get(&info_hash)
            .ok_or(TorrentError::TorrentNotFound { info_hash })?;
        let now = Instant::now();
        Ok(entry.trackers.iter().map(|t| t.snapshot(now)).collect())
    }

    pub(crate) fn stats(&self) -> EngineStats {
        let mut stats = EngineStats {
            torrents: self.torrents.len(),
            ..Default::default()
        };
        for entry in self.torrents.values() {
            match entry.state {
                TorrentState::Downloading => stats.downloading += 1,
                TorrentState::Seeding => stats.seeding += 1,
                _ => {}
            }
            stats.connected_peers += entry.peers.values().filter(|p| p.session.is_some()).count();
            stats.bytes_downloaded += entry.bytes_downloaded;
            stats.bytes_uploaded += entry.bytes_uploaded;
        }
        stats
    }

    // ----- failure and teardown -----

    /// Storage failure or relocation error: halt the torrent until the
    /// operator intervenes.
    fn fail_torrent(&mut self, info_hash: InfoHash, message: String) {
        if let Some(entry) = self.torrents.get_mut(&info_hash) {
            tracing::error!("torrent {info_hash} entered error state: {message}");
            Self::close_all_peers(entry);
            entry.last_error = Some(message.clone());
            entry.state = TorrentState::Error { message };
        }
        self.queue.remove(info_hash);
    }

    fn spawn_stop_announce(&self, entry: &mut TorrentEntry, info_hash: InfoHash) {
        let Some(tier) = entry.trackers.first_mut() else {
            return;
        };
        let Some(url) = tier.active_url().map(|u| u.to_string()) else {
            return;
        };
        let request = AnnounceRequest {
            info_hash,
            peer_id: *self.peer_id.as_bytes(),
            port: self.config.network.listen_port,
            uploaded: entry.bytes_uploaded,
            downloaded: entry.bytes_downloaded,
            left: entry.pieces.bytes_left(),
            event: AnnounceEvent::Stopped,
        };
        let network = self.config.network.clone();
        tokio::spawn(async move {
            if let Ok(client) = HttpTrackerClient::new(url, &network) {
                let _ = client.announce(request).await;
            }
        });
    }

    fn spawn_stop_announce_at(&mut self, info_hash: InfoHash) {
        let peer_id = self.peer_id;
        let port = self.config.network.listen_port;
        let network = self.config.network.clone();
        let Some(entry) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let Some(url) = entry
            .trackers
            .first()
            .and_then(|t| t.active_url())
            .map(|u| u.to_string())
        else {
            return;
        };
        let request = AnnounceRequest {
            info_hash,
            peer_id: *peer_id.as_bytes(),
            port,
            uploaded: entry.bytes_uploaded,
            downloaded: entry.bytes_downloaded,
            left: entry.pieces.bytes_left(),
            event: AnnounceEvent::Stopped,
        };
        tokio::spawn(async move {
            if let Ok(client) = HttpTrackerClient::new(url, &network) {
                let _ = client.announce(request).await;
            }
        });
    }

    /// Drops one peer: aborts its I/O task, returns its outstanding requests
    /// to the piece store, and removes its bitfield from availability.
    fn drop_peer(entry: &mut TorrentEntry, address: SocketAddr, reason: &str) {
        let Some(peer) = entry.peers.remove(&address) else {
            return;
        };
        peer.task.abort();
        if let Some(session) = peer.session {
            for request in session.outstanding_requests() {
                entry.pieces.release_request(&request);
            }
            if let Some(bits) = session.peer_pieces() {
                entry.pieces.remove_peer_bitfield(bits);
            }
        }
        entry.candidates.mark_disconnected(address);
        tracing::debug!("peer {address} closed: {reason}");
    }

    fn close_all_peers(entry: &mut TorrentEntry) {
        let addresses: Vec<SocketAddr> = entry.peers.keys().copied().collect();
        for address in addresses {
            Self::drop_peer(entry, address, "session closing");
        }
    }

    /// Cancels everything on engine shutdown.
    pub(crate) fn shutdown(&mut self) {
        let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for info_hash in hashes {
            if let Some(entry) = self.torrents.get_mut(&info_hash) {
                Self::close_all_peers(entry);
            }
        }
        tracing::debug!("engine shut down with {} torrents", self.torrents.len());
    }
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};

    use super::*;

    fn sha1_of(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }

    fn test_metadata(
        seed: u8,
        piece_count: usize,
        piece_length: u32,
    ) -> (TorrentMetadata, Vec<Vec<u8>>) {
        let pieces: Vec<Vec<u8>> = (0..piece_count)
            .map(|i| vec![seed.wrapping_add(i as u8); piece_length as usize])
            .collect();
        let metadata = TorrentMetadata {
            info_hash: InfoHash::new([seed; 20]),
            name: format!("test-{seed}.bin"),
            piece_length,
            piece_hashes: pieces.iter().map(|p| sha1_of(p)).collect(),
            total_length: piece_count as u64 * piece_length as u64,
            files: vec![crate::torrent::TorrentFile {
                path: vec![format!("test-{seed}.bin")],
                length: piece_count as u64 * piece_length as u64,
            }],
            announce_tiers: vec![vec!["http://127.0.0.1:1/announce".to_string()]],
            private: false,
            comment: None,
            created_by: None,
            creation_date: None,
        };
        (metadata, pieces)
    }

    struct Rig {
        engine: Engine,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        _peer_events: mpsc::UnboundedReceiver<PeerTaskEvent>,
        _dir: tempfile::TempDir,
    }

    fn rig(max_active: usize) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UndertowConfig::default();
        config.storage.download_dir = dir.path().to_path_buf();
        config.limits.max_active_downloads = max_active;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let engine = Engine::new(config, events_tx, peer_tx);
        Rig {
            engine,
            events: events_rx,
            _peer_events: peer_rx,
            _dir: dir,
        }
    }

    /// Drains engine events and ticks until the condition holds. Announce
    /// outcomes from the unreachable test tracker are handled along the way.
    async fn pump_until(rig: &mut Rig, mut done: impl FnMut(&Engine) -> bool) {
        for _ in 0..200 {
            if done(&rig.engine) {
                return;
            }
            rig.engine.handle_tick();
            if done(&rig.engine) {
                return;
            }
            match tokio::time::timeout(Duration::from_millis(100), rig.events.recv()).await {
                Ok(Some(event)) => rig.engine.handle_event(event),
                Ok(None) => panic!("engine events channel closed"),
                Err(_) => {}
            }
        }
        panic!("condition not reached");
    }

    async fn wait_for_state(rig: &mut Rig, info_hash: InfoHash, want: TorrentState) {
        pump_until(rig, |engine| {
            engine
                .session_snapshot(info_hash)
                .map(|s| s.state == want)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let mut rig = rig(4);
        let (metadata, _) = test_metadata(1, 2, 64);

        rig.engine.add_torrent_metadata(metadata.clone()).unwrap();
        let result = rig.engine.add_torrent_metadata(metadata);
        assert!(matches!(
            result,
            Err(TorrentError::DuplicateTorrent { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_then_download_then_seed() {
        let mut rig = rig(4);
        let (metadata, pieces) = test_metadata(2, 3, 64);
        let info_hash = rig.engine.add_torrent_metadata(metadata).unwrap();

        assert_eq!(
            rig.engine.session_snapshot(info_hash).unwrap().state,
            TorrentState::Verifying
        );

        wait_for_state(&mut rig, info_hash, TorrentState::Downloading).await;

        for (index, piece) in pieces.iter().enumerate() {
            rig.engine
                .handle_block(info_hash, PieceIndex::new(index as u32), 0, piece.clone())
                .unwrap();
        }

        wait_for_state(&mut rig, info_hash, TorrentState::Seeding).await;
        let snapshot = rig.engine.session_snapshot(info_hash).unwrap();
        assert_eq!(snapshot.bytes_have, snapshot.total_size);
        assert_eq!(snapshot.progress, 1.0);
    }

    #[tokio::test]
    async fn test_corrupted_block_discarded_and_rewanted() {
        let mut rig = rig(4);
        let (metadata, pieces) = test_metadata(3, 2, 64);
        let info_hash = rig.engine.add_torrent_metadata(metadata).unwrap();
        wait_for_state(&mut rig, info_hash, TorrentState::Downloading).await;

        // Piece 0 correct, piece 1 corrupted
        rig.engine
            .handle_block(info_hash, PieceIndex::new(0), 0, pieces[0].clone())
            .unwrap();
        rig.engine
            .handle_block(info_hash, PieceIndex::new(1), 0, vec![0xFF; 64])
            .unwrap();

        pump_until(&mut rig, |engine| {
            engine
                .session_snapshot(info_hash)
                .map(|s| s.discarded_bytes == 64 && s.bytes_have == 64)
                .unwrap_or(false)
        })
        .await;

        let snapshot = rig.engine.session_snapshot(info_hash).unwrap();
        assert_eq!(snapshot.state, TorrentState::Downloading);
        assert!(snapshot
            .last_error
            .as_deref()
            .unwrap()
            .contains("failed checksum"));

        // The piece is wanted again; a correct retry completes the torrent
        rig.engine
            .handle_block(info_hash, PieceIndex::new(1), 0, pieces[1].clone())
            .unwrap();
        wait_for_state(&mut rig, info_hash, TorrentState::Seeding).await;
    }

    #[tokio::test]
    async fn test_queue_cap_holds_second_torrent() {
        let mut rig = rig(1);
        let (first, first_pieces) = test_metadata(4, 2, 64);
        let (second, _) = test_metadata(5, 2, 64);

        let first_hash = rig.engine.add_torrent_metadata(first).unwrap();
        wait_for_state(&mut rig, first_hash, TorrentState::Downloading).await;

        let second_hash = rig.engine.add_torrent_metadata(second).unwrap();
        wait_for_state(&mut rig, second_hash, TorrentState::QueuedForDownload).await;

        // The cap holds while the first is still downloading
        rig.engine.handle_tick();
        assert_eq!(
            rig.engine.session_snapshot(second_hash).unwrap().state,
            TorrentState::QueuedForDownload
        );

        // Finish the first; the second takes the freed slot
        for (index, piece) in first_pieces.iter().enumerate() {
            rig.engine
                .handle_block(first_hash, PieceIndex::new(index as u32), 0, piece.clone())
                .unwrap();
        }
        wait_for_state(&mut rig, first_hash, TorrentState::Seeding).await;
        wait_for_state(&mut rig, second_hash, TorrentState::Downloading).await;
    }

    #[tokio::test]
    async fn test_start_now_bypasses_cap() {
        let mut rig = rig(1);
        let (first, _) = test_metadata(8, 2, 64);
        let (second, _) = test_metadata(9, 2, 64);

        let first_hash = rig.engine.add_torrent_metadata(first).unwrap();
        wait_for_state(&mut rig, first_hash, TorrentState::Downloading).await;

        let second_hash = rig.engine.add_torrent_metadata(second).unwrap();
        wait_for_state(&mut rig, second_hash, TorrentState::QueuedForDownload).await;

        rig.engine.start_now(second_hash).unwrap();
        let snapshot = rig.engine.session_snapshot(second_hash).unwrap();
        assert_eq!(snapshot.state, TorrentState::Downloading);
        // The first torrent keeps its slot
        assert_eq!(
            rig.engine.session_snapshot(first_hash).unwrap().state,
            TorrentState::Downloading
        );
    }

    #[tokio::test]
    async fn test_pause_preserves_piece_state_and_resumes() {
        let mut rig = rig(4);
        let (metadata, pieces) = test_metadata(6, 2, 64);
        let info_hash = rig.engine.add_torrent_metadata(metadata).unwrap();
        wait_for_state(&mut rig, info_hash, TorrentState::Downloading).await;

        rig.engine
            .handle_block(info_hash, PieceIndex::new(0), 0, pieces[0].clone())
            .unwrap();
        pump_until(&mut rig, |engine| {
            engine
                .session_snapshot(info_hash)
                .map(|s| s.bytes_have == 64)
                .unwrap_or(false)
        })
        .await;

        rig.engine.pause(info_hash).unwrap();
        let snapshot = rig.engine.session_snapshot(info_hash).unwrap();
        assert!(snapshot.state.is_paused());
        assert_eq!(snapshot.bytes_have, 64);

        rig.engine.resume(info_hash).unwrap();
        wait_for_state(&mut rig, info_hash, TorrentState::Downloading).await;
        assert_eq!(
            rig.engine.session_snapshot(info_hash).unwrap().bytes_have,
            64
        );
    }

    #[tokio::test]
    async fn test_magnet_waits_for_metadata() {
        let mut rig = rig(4);
        let magnet = "magnet:?xt=urn:btih:0707070707070707070707070707070707070707&dn=later&tr=http://127.0.0.1:1/announce";
        let info_hash = rig.engine.add_magnet(magnet).await.unwrap();

        rig.engine.handle_tick();
        // Without a piece layout the torrent cannot enter Downloading
        assert_eq!(
            rig.engine.session_snapshot(info_hash).unwrap().state,
            TorrentState::QueuedForDownload
        );

        let (mut metadata, _) = test_metadata(7, 2, 64);
        metadata.info_hash = info_hash;
        rig.engine.add_torrent_metadata(metadata).unwrap();
        assert_eq!(
            rig.engine.session_snapshot(info_hash).unwrap().state,
            TorrentState::Verifying
        );
    }

    #[tokio::test]
    async fn test_remove_unknown_torrent() {
        let mut rig = rig(4);
        let result = rig.engine.remove(InfoHash::new([9u8; 20]), false);
        assert!(matches!(result, Err(TorrentError::TorrentNotFound { .. })));
    }

    #[tokio::test]
    async fn test_peer_candidates_respect_private_flag() {
        let mut rig = rig(4);
        let (mut metadata, _) = test_metadata(10, 2, 64);
        metadata.private = true;
        let info_hash = rig.engine.add_torrent_metadata(metadata).unwrap();

        let added = rig
            .engine
            .add_peer_candidates(
                info_hash,
                PeerSource::Dht,
                vec!["10.1.1.1:6881".parse().unwrap()],
            )
            .unwrap();
        assert_eq!(added, 0);

        let added = rig
            .engine
            .add_peer_candidates(
                info_hash,
                PeerSource::Tracker,
                vec!["10.1.1.2:6881".parse().unwrap()],
            )
            .unwrap();
        assert_eq!(added, 1);
    }
}
