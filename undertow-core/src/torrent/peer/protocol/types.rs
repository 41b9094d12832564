//! Core types for the BitTorrent wire protocol.

use bytes::Bytes;

use crate::torrent::{InfoHash, PieceIndex};

/// BitTorrent peer identifier.
///
/// 20-byte identifier for peers in the BitTorrent network.
/// Used in handshakes and tracker communication to identify clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates peer ID from 20-byte array.
    pub fn new(id: [u8; 20]) -> Self {
        Self(id)
    }

    /// Returns peer ID as byte array reference.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Generate random peer ID for this client.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-UW0001-");
        for byte in &mut id[8..] {
            *byte = rand::random();
        }
        Self(id)
    }
}

/// Reserved byte carrying our cipher-offer flag during handshake.
const CRYPTO_RESERVED_BYTE: usize = 1;
const CRYPTO_RESERVED_BIT: u8 = 0x80;

/// Peer handshake information.
///
/// Initial exchange between peers to establish protocol compatibility and
/// verify info hash matching. The reserved bytes carry the cipher offer used
/// by encryption negotiation.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerHandshake {
    /// Protocol identifier string ("BitTorrent protocol")
    pub protocol: String,
    /// Reserved bytes for protocol extensions
    pub reserved: [u8; 8],
    /// Info hash of the torrent being shared
    pub info_hash: InfoHash,
    /// Unique identifier for the peer
    pub peer_id: PeerId,
}

impl PeerHandshake {
    /// Create handshake for BitTorrent protocol.
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            protocol: "BitTorrent protocol".to_string(),
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Marks the handshake as offering an encrypted stream.
    pub fn with_crypto_offer(mut self) -> Self {
        self.reserved[CRYPTO_RESERVED_BYTE] |= CRYPTO_RESERVED_BIT;
        self
    }

    /// True when the remote side offered an encrypted stream.
    pub fn offers_crypto(&self) -> bool {
        self.reserved[CRYPTO_RESERVED_BYTE] & CRYPTO_RESERVED_BIT != 0
    }
}

/// BitTorrent wire protocol messages.
///
/// Complete set of message types defined in BEP 3 for peer communication.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Keep-alive message to maintain connection
    KeepAlive,
    /// Inform peer that we are choking them
    Choke,
    /// Inform peer that we are no longer choking them
    Unchoke,
    /// Inform peer that we are interested in their pieces
    Interested,
    /// Inform peer that we are not interested in their pieces
    NotInterested,
    /// Inform peer that we have acquired a specific piece
    Have { piece_index: PieceIndex },
    /// Send our complete piece availability bitmap
    Bitfield { bitfield: Bytes },
    /// Request a block of data from a piece
    Request {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// Send a block of piece data
    Piece {
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    },
    /// Cancel a previously sent request
    Cancel {
        piece_index: PieceIndex,
        offset: u32,
        length: u32,
    },
    /// Inform peer of our DHT port
    Port { port: u16 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_prefix() {
        let id = PeerId::generate();
        assert_eq!(&id.as_bytes()[..8], b"-UW0001-");
    }

    #[test]
    fn test_crypto_offer_flag() {
        let plain = PeerHandshake::new(InfoHash::new([1u8; 20]), PeerId::generate());
        assert!(!plain.offers_crypto());

        let offering = plain.clone().with_crypto_offer();
        assert!(offering.offers_crypto());
        assert_eq!(offering.info_hash, plain.info_hash);
    }
}
