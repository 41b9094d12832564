//! BitTorrent wire protocol message serialization and deserialization

use bytes::{Buf, BufMut, Bytes};

use super::types::PeerMessage;
use crate::torrent::{PieceIndex, TorrentError};

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Serializes peer message following BEP 3
    pub fn serialize_message(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // Length = 0
            }
            PeerMessage::Choke => {
                buf.put_u32(1); // Length = 1
                buf.put_u8(0); // Message ID
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // Length = 1 + 4
                buf.put_u8(4);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(5);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // Length = 1 + 4 + 4 + 4
                buf.put_u8(6);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // Length = 1 + 4 + 4 + data.len()
                buf.put_u8(7);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3); // Length = 1 + 2
                buf.put_u8(9);
                buf.put_u16(*port);
            }
        }

        buf
    }

    /// Deserializes peer message following BEP 3
    ///
    /// # Errors
    /// - `TorrentError::ProtocolViolation` - Malformed or truncated message
    pub fn deserialize_message(data: &[u8]) -> Result<PeerMessage, TorrentError> {
        if data.len() < 4 {
            return Err(TorrentError::ProtocolViolation {
                reason: "Message too short".to_string(),
            });
        }

        let mut buf = data;
        let length = buf.get_u32();

        if length == 0 {
            return Ok(PeerMessage::KeepAlive);
        }

        if data.len() < 4 + length as usize {
            return Err(TorrentError::ProtocolViolation {
                reason: "Incomplete message".to_string(),
            });
        }

        let message_id = buf.get_u8();

        match message_id {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                if length != 5 {
                    return Err(TorrentError::ProtocolViolation {
                        reason: "Invalid Have message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                Ok(PeerMessage::Have { piece_index })
            }
            5 => {
                let bitfield_len = length - 1;
                let bitfield = Bytes::copy_from_slice(&buf[..bitfield_len as usize]);
                Ok(PeerMessage::Bitfield { bitfield })
            }
            6 => {
                if length != 13 {
                    return Err(TorrentError::ProtocolViolation {
                        reason: "Invalid Request message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Request {
                    piece_index,
                    offset,
                    length,
                })
            }
            7 => {
                if length < 9 {
                    return Err(TorrentError::ProtocolViolation {
                        reason: "Invalid Piece message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let data_len = length - 9;
                let data = Bytes::copy_from_slice(&buf[..data_len as usize]);
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data,
                })
            }
            8 => {
                if length != 13 {
                    return Err(TorrentError::ProtocolViolation {
                        reason: "Invalid Cancel message length".to_string(),
                    });
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(PeerMessage::Cancel {
                    piece_index,
                    offset,
                    length,
                })
            }
            9 => {
                if length != 3 {
                    return Err(TorrentError::ProtocolViolation {
                        reason: "Invalid Port message length".to_string(),
                    });
                }
                let port = buf.get_u16();
                Ok(PeerMessage::Port { port })
            }
            _ => Err(TorrentError::ProtocolViolation {
                reason: format!("Unknown message ID: {message_id}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_message_roundtrip() {
        for message in [
            PeerMessage::KeepAlive,
            PeerMessage::Choke,
            PeerMessage::Unchoke,
            PeerMessage::Interested,
            PeerMessage::NotInterested,
        ] {
            let wire = MessageCodec::serialize_message(&message);
            let parsed = MessageCodec::deserialize_message(&wire).unwrap();
            assert_eq!(parsed, message);
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let message = PeerMessage::Request {
            piece_index: PieceIndex::new(7),
            offset: 16384,
            length: 16384,
        };
        let wire = MessageCodec::serialize_message(&message);
        assert_eq!(wire.len(), 17);
        assert_eq!(MessageCodec::deserialize_message(&wire).unwrap(), message);
    }

    #[test]
    fn test_piece_roundtrip() {
        let message = PeerMessage::Piece {
            piece_index: PieceIndex::new(3),
            offset: 0,
            data: Bytes::from_static(b"block data"),
        };
        let wire = MessageCodec::serialize_message(&message);
        assert_eq!(MessageCodec::deserialize_message(&wire).unwrap(), message);
    }

    #[test]
    fn test_unknown_message_id_rejected() {
        let wire = [0u8, 0, 0, 1, 42];
        let result = MessageCodec::deserialize_message(&wire);
        assert!(matches!(
            result,
            Err(TorrentError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_truncated_message_rejected() {
        // Claims 13 bytes of payload but carries none
        let wire = [0u8, 0, 0, 13, 6];
        let result = MessageCodec::deserialize_message(&wire);
        assert!(matches!(
            result,
            Err(TorrentError::ProtocolViolation { .. })
        ));
    }
}
