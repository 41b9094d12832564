//! Piece and block bookkeeping for a single torrent.
//!
//! Tracks which pieces are wanted/verified, buffers incoming blocks until a
//! piece is complete, maintains per-piece availability counts from peer
//! have/bitfield traffic, and selects the next blocks to request using
//! rarest-first with a seeded random tie-break.

use std::collections::HashMap;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha1::{Digest, Sha1};

use super::peer::state::PeerBitfield;
use super::{PieceIndex, TorrentError};

/// Transfer granularity within a piece. The final block of a piece may be short.
pub const BLOCK_SIZE: u32 = 16_384;

/// Duplicate-request ceiling per block once the download reaches endgame.
const ENDGAME_MAX_DUPLICATES: u8 = 2;

/// A block request to send to a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: PieceIndex,
    pub offset: u32,
    pub length: u32,
}

/// Result of feeding a received block into the store.
#[derive(Debug)]
pub enum BlockReceipt {
    /// Block stored; the piece is still missing blocks.
    Accepted,
    /// Block was not needed (piece unwanted, already verified, or duplicate).
    Ignored,
    /// Final missing block arrived; the assembled piece bytes are ready for
    /// checksum verification.
    PieceComplete(Vec<u8>),
}

/// Outcome of verifying an assembled piece against its declared checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Verified,
    Failed,
}

/// Blocks received so far for one in-progress piece.
#[derive(Debug)]
struct PartialPiece {
    blocks: Vec<bool>,
    received: u32,
    data: Vec<u8>,
}

impl PartialPiece {
    fn new(piece_size: u32) -> Self {
        let block_count = piece_size.div_ceil(BLOCK_SIZE);
        Self {
            blocks: vec![false; block_count as usize],
            received: 0,
            data: vec![0u8; piece_size as usize],
        }
    }

    fn is_complete(&self) -> bool {
        self.received as usize == self.blocks.len()
    }
}

/// Piece/block state for one torrent.
///
/// Mutated only by the owning session task; block-received events are
/// serialized through here so verification always sees a consistent final
/// state. A piece is never reported "have" until verified.
pub struct PieceStore {
    piece_length: u32,
    total_length: u64,
    piece_hashes: Vec<[u8; 20]>,
    wanted: Vec<bool>,
    verified: Vec<bool>,
    verifying: Vec<bool>,
    partial: HashMap<u32, PartialPiece>,
    availability: Vec<u32>,
    /// Outstanding request count per (piece, offset) block.
    in_flight: HashMap<(u32, u32), u8>,
    rng: ChaCha8Rng,
    discarded_bytes: u64,
}

impl PieceStore {
    /// Creates a store for the given piece layout. All pieces start wanted.
    ///
    /// The seed drives the rarest-first tie-break; sessions pass a random
    /// seed, tests a fixed one for reproducible selection.
    pub fn new(piece_length: u32, total_length: u64, piece_hashes: Vec<[u8; 20]>, seed: u64) -> Self {
        let count = piece_hashes.len();
        Self {
            piece_length,
            total_length,
            piece_hashes,
            wanted: vec![true; count],
            verified: vec![false; count],
            verifying: vec![false; count],
            partial: HashMap::new(),
            availability: vec![0; count],
            in_flight: HashMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            discarded_bytes: 0,
        }
    }

    /// Number of pieces in the torrent.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Byte length of the given piece (the final piece may be short).
    pub fn piece_size(&self, piece: u32) -> u32 {
        let start = piece as u64 * self.piece_length as u64;
        let remaining = self.total_length.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    fn block_length(&self, piece: u32, offset: u32) -> u32 {
        (self.piece_size(piece) - offset).min(BLOCK_SIZE)
    }

    /// Feeds a received block into the store.
    ///
    /// Rejects blocks outside the declared piece layout; blocks for pieces
    /// that are unwanted, already verified, or duplicated are ignored without
    /// error. Receiving the last missing block yields the assembled bytes.
    ///
    /// # Errors
    ///
    /// - `TorrentError::ProtocolViolation` - Block outside the piece layout
    pub fn mark_block_received(
        &mut self,
        piece: PieceIndex,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockReceipt, TorrentError> {
        let index = piece.as_u32();
        if index >= self.piece_count() {
            return Err(TorrentError::ProtocolViolation {
                reason: format!("block for piece {index} beyond piece count"),
            });
        }
        if offset % BLOCK_SIZE != 0 || offset >= self.piece_size(index) {
            return Err(TorrentError::ProtocolViolation {
                reason: format!("block offset {offset} outside piece {index}"),
            });
        }
        if data.len() as u32 != self.block_length(index, offset) {
            return Err(TorrentError::ProtocolViolation {
                reason: format!(
                    "block length {} does not match layout for piece {index} offset {offset}",
                    data.len()
                ),
            });
        }

        self.in_flight.remove(&(index, offset));

        if !self.wanted[index as usize]
            || self.verified[index as usize]
            || self.verifying[index as usize]
        {
            return Ok(BlockReceipt::Ignored);
        }

        let piece_size = self.piece_size(index);
        let partial = self
            .partial
            .entry(index)
            .or_insert_with(|| PartialPiece::new(piece_size));

        let block_index = (offset / BLOCK_SIZE) as usize;
        if partial.blocks[block_index] {
            return Ok(BlockReceipt::Ignored);
        }

        partial.blocks[block_index] = true;
        partial.received += 1;
        partial.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);

        if partial.is_complete() {
            let assembled = self.partial.remove(&index).map(|p| p.data).unwrap_or_default();
            self.verifying[index as usize] = true;
            self.clear_piece_in_flight(index);
            return Ok(BlockReceipt::PieceComplete(assembled));
        }

        Ok(BlockReceipt::Accepted)
    }

    /// Returns the declared checksum for a piece.
    pub fn expected_hash(&self, piece: PieceIndex) -> Option<[u8; 20]> {
        self.piece_hashes.get(piece.as_u32() as usize).copied()
    }

    /// Verifies assembled piece bytes and records the outcome.
    ///
    /// A failed check clears the piece entirely (no partial credit), re-marks
    /// it wanted, and counts the discarded bytes.
    pub fn verify_piece(&mut self, piece: PieceIndex, bytes: &[u8]) -> VerifyOutcome {
        let matched = self
            .expected_hash(piece)
            .map(|expected| hash_matches(&expected, bytes))
            .unwrap_or(false);
        self.record_verify_result(piece, matched)
    }

    /// Records a verification result computed elsewhere (the verify pool).
    pub fn record_verify_result(&mut self, piece: PieceIndex, matched: bool) -> VerifyOutcome {
        let index = piece.as_u32() as usize;
        self.verifying[index] = false;
        if matched {
            self.verified[index] = true;
            self.wanted[index] = false;
            VerifyOutcome::Verified
        } else {
            self.partial.remove(&piece.as_u32());
            self.wanted[index] = true;
            self.discarded_bytes += self.piece_size(piece.as_u32()) as u64;
            VerifyOutcome::Failed
        }
    }

    /// Marks a piece verified from an initial disk scan.
    ///
    /// Used when already-present data hashes correctly; does not touch the
    /// discard counter.
    pub fn mark_piece_verified(&mut self, piece: PieceIndex) {
        let index = piece.as_u32() as usize;
        if index < self.verified.len() {
            self.verified[index] = true;
            self.wanted[index] = false;
            self.verifying[index] = false;
        }
    }

    /// Records that a connected peer announced one more copy of a piece.
    pub fn peer_has_piece(&mut self, piece: PieceIndex) {
        if let Some(count) = self.availability.get_mut(piece.as_u32() as usize) {
            *count += 1;
        }
    }

    /// Adds a whole peer bitfield to the availability counts.
    pub fn apply_peer_bitfield(&mut self, bitfield: &PeerBitfield) {
        for piece in 0..self.piece_count() {
            if bitfield.has_piece(PieceIndex::new(piece)) {
                self.availability[piece as usize] += 1;
            }
        }
    }

    /// Removes a departed peer's bitfield from the availability counts.
    pub fn remove_peer_bitfield(&mut self, bitfield: &PeerBitfield) {
        for piece in 0..self.piece_count() {
            if bitfield.has_piece(PieceIndex::new(piece)) {
                let count = &mut self.availability[piece as usize];
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Swarm availability count for a piece.
    pub fn availability(&self, piece: PieceIndex) -> u32 {
        self.availability
            .get(piece.as_u32() as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Selects up to `max` blocks to request from a peer.
    ///
    /// Rarest-first across the pieces the peer has, randomized tie-break at
    /// equal availability, blocks in offset order within a piece. Blocks
    /// already requested elsewhere are skipped until every missing block is
    /// in flight, at which point duplicates are allowed (endgame).
    pub fn select_next_blocks(&mut self, peer: &PeerBitfield, max: usize) -> Vec<BlockRequest> {
        if max == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<(u32, u32, u32)> = Vec::new();
        for piece in 0..self.piece_count() {
            let index = piece as usize;
            if self.wanted[index]
                && !self.verified[index]
                && !self.verifying[index]
                && peer.has_piece(PieceIndex::new(piece))
            {
                let tiebreak = self.rng.random::<u32>();
                candidates.push((self.availability[index], tiebreak, piece));
            }
        }
        candidates.sort_unstable();

        let endgame = self.in_endgame();
        let mut requests = Vec::new();

        for &(_, _, piece) in &candidates {
            if requests.len() >= max {
                break;
            }
            self.push_piece_blocks(piece, max, endgame, &mut requests);
        }

        requests
    }

    /// Appends requestable blocks of one piece, honoring the duplicate rules.
    fn push_piece_blocks(
        &mut self,
        piece: u32,
        max: usize,
        endgame: bool,
        requests: &mut Vec<BlockRequest>,
    ) {
        let piece_size = self.piece_size(piece);
        let block_count = piece_size.div_ceil(BLOCK_SIZE);

        for block in 0..block_count {
            if requests.len() >= max {
                return;
            }
            let offset = block * BLOCK_SIZE;
            if let Some(partial) = self.partial.get(&piece) {
                if partial.blocks[block as usize] {
                    continue;
                }
            }
            let outstanding = self.in_flight.get(&(piece, offset)).copied().unwrap_or(0);
            let allowed = if endgame {
                outstanding < ENDGAME_MAX_DUPLICATES
            } else {
                outstanding == 0
            };
            if !allowed {
                continue;
            }

            *self.in_flight.entry((piece, offset)).or_insert(0) += 1;
            requests.push(BlockRequest {
                piece: PieceIndex::new(piece),
                offset,
                length: self.block_length(piece, offset),
            });
        }
    }

    /// True when every missing block of every wanted piece is already requested.
    fn in_endgame(&self) -> bool {
        for piece in 0..self.piece_count() {
            let index = piece as usize;
            if !self.wanted[index] || self.verified[index] || self.verifying[index] {
                continue;
            }
            let block_count = self.piece_size(piece).div_ceil(BLOCK_SIZE);
            for block in 0..block_count {
                if let Some(partial) = self.partial.get(&piece) {
                    if partial.blocks[block as usize] {
                        continue;
                    }
                }
                let offset = block * BLOCK_SIZE;
                if self.in_flight.get(&(piece, offset)).copied().unwrap_or(0) == 0 {
                    return false;
                }
            }
        }
        true
    }

    /// True when we still need the piece (wanted, not verified, not pending
    /// verification).
    pub fn wants_piece(&self, piece: PieceIndex) -> bool {
        let index = piece.as_u32() as usize;
        index < self.wanted.len()
            && self.wanted[index]
            && !self.verified[index]
            && !self.verifying[index]
    }

    /// True when the peer has at least one piece we still need. Drives the
    /// interested flag.
    pub fn wants_any(&self, peer: &PeerBitfield) -> bool {
        (0..self.piece_count()).any(|p| {
            let piece = PieceIndex::new(p);
            self.wants_piece(piece) && peer.has_piece(piece)
        })
    }

    /// Releases an outstanding request slot, e.g. when the requesting peer
    /// disconnected or the request timed out.
    pub fn release_request(&mut self, request: &BlockRequest) {
        let key = (request.piece.as_u32(), request.offset);
        if let Some(count) = self.in_flight.get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&key);
            }
        }
    }

    fn clear_piece_in_flight(&mut self, piece: u32) {
        self.in_flight.retain(|&(p, _), _| p != piece);
    }

    /// Bitfield of verified pieces, as advertised to peers.
    pub fn have_bitfield(&self) -> PeerBitfield {
        let mut bitfield = PeerBitfield::new(self.piece_count());
        for piece in 0..self.piece_count() {
            if self.verified[piece as usize] {
                bitfield.set_piece(PieceIndex::new(piece));
            }
        }
        bitfield
    }

    /// Verified bytes. Unverified blocks never count.
    pub fn bytes_have(&self) -> u64 {
        (0..self.piece_count())
            .filter(|&p| self.verified[p as usize])
            .map(|p| self.piece_size(p) as u64)
            .sum()
    }

    /// Bytes remaining to download and verify.
    pub fn bytes_left(&self) -> u64 {
        self.total_length - self.bytes_have()
    }

    /// Total torrent size in bytes.
    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    /// True once every piece has verified.
    pub fn is_complete(&self) -> bool {
        self.verified.iter().all(|&v| v)
    }

    /// True while a piece is awaiting its checksum result.
    pub fn is_verifying(&self, piece: PieceIndex) -> bool {
        self.verifying
            .get(piece.as_u32() as usize)
            .copied()
            .unwrap_or(false)
    }

    /// True once the piece passed verification.
    pub fn is_verified(&self, piece: PieceIndex) -> bool {
        self.verified
            .get(piece.as_u32() as usize)
            .copied()
            .unwrap_or(false)
    }

    /// Bytes thrown away after failed checksums.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded_bytes
    }
}

/// Compares assembled piece bytes against a declared SHA-1 checksum.
pub fn hash_matches(expected: &[u8; 20], bytes: &[u8]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().as_slice() == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of(bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&hasher.finalize());
        hash
    }

    /// Two-piece store: piece 0 is two full blocks, piece 1 one short block.
    fn two_piece_store() -> (PieceStore, Vec<Vec<u8>>) {
        let piece0 = vec![0xAB; 2 * BLOCK_SIZE as usize];
        let piece1 = vec![0xCD; 100];
        let hashes = vec![hash_of(&piece0), hash_of(&piece1)];
        let total = piece0.len() as u64 + piece1.len() as u64;
        let store = PieceStore::new(2 * BLOCK_SIZE, total, hashes, 7);
        (store, vec![piece0, piece1])
    }

    fn full_bitfield(pieces: u32) -> PeerBitfield {
        let mut bitfield = PeerBitfield::new(pieces);
        for piece in 0..pieces {
            bitfield.set_piece(PieceIndex::new(piece));
        }
        bitfield
    }

    #[test]
    fn test_block_receipt_progression() {
        let (mut store, data) = two_piece_store();

        let first = store
            .mark_block_received(PieceIndex::new(0), 0, &data[0][..BLOCK_SIZE as usize])
            .unwrap();
        assert!(matches!(first, BlockReceipt::Accepted));

        let second = store
            .mark_block_received(PieceIndex::new(0), BLOCK_SIZE, &data[0][BLOCK_SIZE as usize..])
            .unwrap();
        match second {
            BlockReceipt::PieceComplete(bytes) => assert_eq!(bytes, data[0]),
            other => panic!("expected PieceComplete, got {other:?}"),
        }
    }

    #[test]
    fn test_verified_iff_checksum_matches() {
        let (mut store, data) = two_piece_store();

        store
            .mark_block_received(PieceIndex::new(1), 0, &data[1])
            .map(|receipt| match receipt {
                BlockReceipt::PieceComplete(bytes) => {
                    assert_eq!(store.verify_piece(PieceIndex::new(1), &bytes), VerifyOutcome::Verified);
                }
                other => panic!("expected PieceComplete, got {other:?}"),
            })
            .unwrap();

        assert!(store.is_verified(PieceIndex::new(1)));
        assert_eq!(store.bytes_have(), 100);
    }

    #[test]
    fn test_failed_verify_clears_bitmap_and_counts_discard() {
        let (mut store, data) = two_piece_store();

        let corrupted = vec![0xFF; data[1].len()];
        let receipt = store
            .mark_block_received(PieceIndex::new(1), 0, &corrupted)
            .unwrap();
        let bytes = match receipt {
            BlockReceipt::PieceComplete(bytes) => bytes,
            other => panic!("expected PieceComplete, got {other:?}"),
        };

        assert_eq!(store.verify_piece(PieceIndex::new(1), &bytes), VerifyOutcome::Failed);
        assert!(!store.is_verified(PieceIndex::new(1)));
        assert_eq!(store.discarded_bytes(), 100);
        assert_eq!(store.bytes_have(), 0);

        // The piece is wanted again and its blocks are re-selectable.
        let requests = store.select_next_blocks(&full_bitfield(2), 8);
        assert!(requests.iter().any(|r| r.piece.as_u32() == 1));
    }

    #[test]
    fn test_have_bytes_never_exceed_total() {
        let (mut store, data) = two_piece_store();
        for piece in 0..2u32 {
            let size = store.piece_size(piece);
            let mut offset = 0;
            while offset < size {
                let len = (size - offset).min(BLOCK_SIZE);
                let receipt = store
                    .mark_block_received(
                        PieceIndex::new(piece),
                        offset,
                        &data[piece as usize][offset as usize..(offset + len) as usize],
                    )
                    .unwrap();
                if let BlockReceipt::PieceComplete(bytes) = receipt {
                    store.verify_piece(PieceIndex::new(piece), &bytes);
                }
                offset += len;
            }
        }

        assert!(store.is_complete());
        assert_eq!(store.bytes_have(), store.total_length());
        assert_eq!(store.bytes_left(), 0);
    }

    #[test]
    fn test_block_outside_layout_rejected() {
        let (mut store, _) = two_piece_store();

        let result = store.mark_block_received(PieceIndex::new(5), 0, &[0u8; 16384]);
        assert!(matches!(
            result,
            Err(TorrentError::ProtocolViolation { .. })
        ));

        let result = store.mark_block_received(PieceIndex::new(0), 3, &[0u8; 16384]);
        assert!(matches!(
            result,
            Err(TorrentError::ProtocolViolation { .. })
        ));

        // Wrong length for the final short block of piece 1
        let result = store.mark_block_received(PieceIndex::new(1), 0, &[0u8; 16384]);
        assert!(matches!(
            result,
            Err(TorrentError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_rarest_first_ordering() {
        let hashes = vec![[0u8; 20]; 4];
        let mut store = PieceStore::new(BLOCK_SIZE, 4 * BLOCK_SIZE as u64, hashes, 42);

        // Piece 2 is the rarest, piece 0 the most common.
        for _ in 0..3 {
            store.peer_has_piece(PieceIndex::new(0));
        }
        for _ in 0..2 {
            store.peer_has_piece(PieceIndex::new(1));
        }
        store.peer_has_piece(PieceIndex::new(2));
        store.peer_has_piece(PieceIndex::new(3));
        store.peer_has_piece(PieceIndex::new(3));

        let requests = store.select_next_blocks(&full_bitfield(4), 1);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].piece.as_u32(), 2);
    }

    #[test]
    fn test_tiebreak_reproducible_with_same_seed() {
        let run = |seed: u64| {
            let hashes = vec![[0u8; 20]; 8];
            let mut store = PieceStore::new(BLOCK_SIZE, 8 * BLOCK_SIZE as u64, hashes, seed);
            store
                .select_next_blocks(&full_bitfield(8), 4)
                .iter()
                .map(|r| r.piece.as_u32())
                .collect::<Vec<_>>()
        };

        assert_eq!(run(99), run(99));
    }

    #[test]
    fn test_no_duplicate_requests_before_endgame() {
        let hashes = vec![[0u8; 20]; 2];
        let mut store = PieceStore::new(BLOCK_SIZE, 2 * BLOCK_SIZE as u64, hashes, 1);

        let first = store.select_next_blocks(&full_bitfield(2), 8);
        assert_eq!(first.len(), 2);

        // Everything is now in flight and another peer gets duplicates only
        // because the endgame rule kicks in.
        let second = store.select_next_blocks(&full_bitfield(2), 8);
        assert_eq!(second.len(), 2);
        let third = store.select_next_blocks(&full_bitfield(2), 8);
        assert!(third.is_empty());
    }

    #[test]
    fn test_release_request_restores_selectability() {
        let hashes = vec![[0u8; 20]; 1];
        let mut store = PieceStore::new(BLOCK_SIZE, BLOCK_SIZE as u64, hashes, 1);

        let requests = store.select_next_blocks(&full_bitfield(1), 1);
        assert_eq!(requests.len(), 1);

        store.release_request(&requests[0]);
        let again = store.select_next_blocks(&full_bitfield(1), 1);
        assert_eq!(again, requests);
    }

    #[test]
    fn test_selection_scoped_to_peer_haves() {
        let hashes = vec![[0u8; 20]; 3];
        let mut store = PieceStore::new(BLOCK_SIZE, 3 * BLOCK_SIZE as u64, hashes, 1);

        let mut sparse = PeerBitfield::new(3);
        sparse.set_piece(PieceIndex::new(1));

        let requests = store.select_next_blocks(&sparse, 8);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].piece.as_u32(), 1);
    }

    #[test]
    fn test_availability_tracking() {
        let (mut store, _) = two_piece_store();
        let bitfield = full_bitfield(2);

        store.apply_peer_bitfield(&bitfield);
        store.peer_has_piece(PieceIndex::new(0));
        assert_eq!(store.availability(PieceIndex::new(0)), 2);
        assert_eq!(store.availability(PieceIndex::new(1)), 1);

        store.remove_peer_bitfield(&bitfield);
        assert_eq!(store.availability(PieceIndex::new(0)), 1);
        assert_eq!(store.availability(PieceIndex::new(1)), 0);
    }

    #[test]
    fn test_unverified_pieces_not_in_have_bitfield() {
        let (mut store, data) = two_piece_store();

        store
            .mark_block_received(PieceIndex::new(0), 0, &data[0][..BLOCK_SIZE as usize])
            .unwrap();

        let have = store.have_bitfield();
        assert!(!have.has_piece(PieceIndex::new(0)));
        assert!(!have.has_piece(PieceIndex::new(1)));
        assert_eq!(store.bytes_have(), 0);
    }
}
