//! Per-peer connection state: role flags, bitfield, and the bounded block
//! request pipeline.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::torrent::discovery::PeerSource;
use crate::torrent::piece_store::BlockRequest;
use crate::torrent::{PieceIndex, TorrentError};

/// A block request sent to a peer, awaiting its piece message.
#[derive(Debug, Clone)]
pub struct PendingBlockRequest {
    pub request: BlockRequest,
    pub requested_at: Instant,
}

impl PendingBlockRequest {
    /// Create new pending request with current timestamp
    pub fn new(request: BlockRequest) -> Self {
        Self {
            request,
            requested_at: Instant::now(),
        }
    }

    /// Check if request has exceeded the timeout duration
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.requested_at.elapsed() > timeout
    }
}

/// Bitfield representing which pieces a peer has
#[derive(Debug, Clone)]
pub struct PeerBitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl PeerBitfield {
    /// Create new empty bitfield for given number of pieces
    pub fn new(piece_count: u32) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0u8; byte_count as usize],
            piece_count,
        }
    }

    /// Create bitfield from raw bytes (received from peer)
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Invalid bitfield size for piece count
    pub fn from_bytes(piece_data: Bytes, piece_count: u32) -> Result<Self, TorrentError> {
        let expected_bytes = piece_count.div_ceil(8);
        if piece_data.len() != expected_bytes as usize {
            return Err(TorrentError::ProtocolViolation {
                reason: format!(
                    "Invalid bitfield size: expected {} bytes for {} pieces, got {}",
                    expected_bytes,
                    piece_count,
                    piece_data.len()
                ),
            });
        }

        Ok(Self {
            bits: piece_data.to_vec(),
            piece_count,
        })
    }

    /// Check if peer has specific piece
    pub fn has_piece(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8); // MSB first

        byte_index < self.bits.len() && (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    /// Mark piece as available (set bit)
    pub fn set_piece(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Number of pieces the bitfield covers.
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Number of pieces marked available.
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// True when every piece bit is set.
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.piece_count
    }

    /// Raw bytes for a bitfield wire message.
    pub fn as_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }
}

/// Established-connection state for one peer.
///
/// Tracks the four directional role flags, the peer's announced pieces, and
/// the bounded request pipeline refilled as piece messages arrive. Owned by
/// the torrent's session; the wire task only ships messages.
#[derive(Debug)]
pub struct PeerSession {
    address: SocketAddr,
    source: PeerSource,
    /// We are choking the peer (refusing their requests)
    am_choking: bool,
    /// Peer is choking us (our requests will be ignored)
    peer_choking: bool,
    /// We want pieces the peer has
    am_interested: bool,
    /// Peer wants pieces we have
    peer_interested: bool,
    /// Connection was accepted rather than dialed
    incoming: bool,
    /// Negotiated stream cipher is active
    encrypted: bool,
    peer_pieces: Option<PeerBitfield>,
    pending: VecDeque<PendingBlockRequest>,
    pipeline_depth: usize,
    last_activity: Instant,
    last_data_exchange: Option<Instant>,
    bytes_downloaded: u64,
    bytes_uploaded: u64,
}

impl PeerSession {
    /// Creates state for a freshly established connection. Both sides start
    /// choked and uninterested per BEP 3.
    pub fn new(
        address: SocketAddr,
        source: PeerSource,
        incoming: bool,
        encrypted: bool,
        pipeline_depth: usize,
    ) -> Self {
        Self {
            address,
            source,
            am_choking: true,
            peer_choking: true,
            am_interested: false,
            peer_interested: false,
            incoming,
            encrypted,
            peer_pieces: None,
            pending: VecDeque::new(),
            pipeline_depth,
            last_activity: Instant::now(),
            last_data_exchange: None,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn source(&self) -> PeerSource {
        self.source
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn am_choking(&self) -> bool {
        self.am_choking
    }

    pub fn peer_choking(&self) -> bool {
        self.peer_choking
    }

    pub fn am_interested(&self) -> bool {
        self.am_interested
    }

    pub fn peer_interested(&self) -> bool {
        self.peer_interested
    }

    /// Peer has every piece except some, announced via a partial bitfield
    /// while uploading-only. Used for seed accounting in snapshots.
    pub fn is_partial_seed(&self) -> bool {
        match &self.peer_pieces {
            Some(pieces) => {
                let set = pieces.count_set();
                set > 0 && set < pieces.piece_count() && set * 10 >= pieces.piece_count() * 9
            }
            None => false,
        }
    }

    pub fn is_seed(&self) -> bool {
        self.peer_pieces
            .as_ref()
            .map(|pieces| pieces.is_complete())
            .unwrap_or(false)
    }

    pub fn peer_pieces(&self) -> Option<&PeerBitfield> {
        self.peer_pieces.as_ref()
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    /// Records that the peer choked us. Outstanding requests are void; the
    /// caller releases them back to the piece store.
    pub fn record_peer_choked(&mut self) -> Vec<BlockRequest> {
        self.peer_choking = true;
        self.touch();
        self.pending.drain(..).map(|p| p.request).collect()
    }

    pub fn record_peer_unchoked(&mut self) {
        self.peer_choking = false;
        self.touch();
    }

    pub fn record_peer_interested(&mut self) {
        self.peer_interested = true;
        self.touch();
    }

    pub fn record_peer_not_interested(&mut self) {
        self.peer_interested = false;
        self.touch();
    }

    pub fn set_am_choking(&mut self, choking: bool) {
        self.am_choking = choking;
    }

    pub fn set_am_interested(&mut self, interested: bool) {
        self.am_interested = interested;
    }

    /// Applies a have message to the peer's piece set.
    pub fn record_have(&mut self, piece: PieceIndex, piece_count: u32) {
        self.touch();
        self.peer_pieces
            .get_or_insert_with(|| PeerBitfield::new(piece_count))
            .set_piece(piece);
    }

    /// Applies the peer's initial bitfield.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Bitfield size does not match layout
    pub fn record_bitfield(&mut self, raw: Bytes, piece_count: u32) -> Result<(), TorrentError> {
        self.touch();
        self.peer_pieces = Some(PeerBitfield::from_bytes(raw, piece_count)?);
        Ok(())
    }

    /// Number of additional requests the pipeline can absorb. Zero while the
    /// peer is choking us.
    pub fn request_capacity(&self) -> usize {
        if self.peer_choking {
            0
        } else {
            self.pipeline_depth.saturating_sub(self.pending.len())
        }
    }

    /// Tracks a request we just sent.
    pub fn track_request(&mut self, request: BlockRequest) {
        self.pending.push_back(PendingBlockRequest::new(request));
    }

    /// Matches an arriving piece message to its pending request, freeing a
    /// pipeline slot.
    pub fn complete_request(&mut self, piece: PieceIndex, offset: u32) -> Option<BlockRequest> {
        self.touch();
        self.last_data_exchange = Some(Instant::now());
        let position = self
            .pending
            .iter()
            .position(|p| p.request.piece == piece && p.request.offset == offset)?;
        self.pending.remove(position).map(|p| p.request)
    }

    /// Removes and returns requests older than the timeout so they can be
    /// released and retried elsewhere.
    pub fn take_expired_requests(&mut self, timeout: Duration) -> Vec<BlockRequest> {
        let mut expired = Vec::new();
        self.pending.retain(|pending| {
            if pending.is_expired(timeout) {
                expired.push(pending.request);
                false
            } else {
                true
            }
        });
        expired
    }

    /// Outstanding requests, e.g. for release when the connection closes.
    pub fn outstanding_requests(&self) -> Vec<BlockRequest> {
        self.pending.iter().map(|p| p.request).collect()
    }

    pub fn record_block_downloaded(&mut self, bytes: u64) {
        self.bytes_downloaded += bytes;
        self.last_data_exchange = Some(Instant::now());
        self.touch();
    }

    pub fn record_block_uploaded(&mut self, bytes: u64) {
        self.bytes_uploaded += bytes;
        self.last_data_exchange = Some(Instant::now());
        self.touch();
    }

    /// True when nothing has happened on the connection for the timeout.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_activity.elapsed() > timeout
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}
