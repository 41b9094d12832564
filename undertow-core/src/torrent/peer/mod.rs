//! Peer connection management: wire protocol, connection state machine,
//! per-peer session state, and upload slot allocation.

pub mod choker;
pub mod connection;
pub mod protocol;
pub mod state;

pub use choker::{ChokeCandidate, ChokeDecision, Choker};
pub use connection::{
    spawn_peer_task, ConnectionPhase, PeerTaskEvent, PeerTaskHandle, PeerWire,
};
pub use protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
pub use state::{PeerBitfield, PeerSession, PendingBlockRequest};
