//! BitTorrent wire protocol: handshake and message codecs.

pub mod handshake;
pub mod messages;
pub mod types;

pub use handshake::{HandshakeCodec, HANDSHAKE_LENGTH};
pub use messages::MessageCodec;
pub use types::{PeerHandshake, PeerId, PeerMessage};
