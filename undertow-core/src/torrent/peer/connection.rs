//! Peer wire connection: dial, handshake (with encryption negotiation), and
//! the per-connection I/O task.
//!
//! The connection moves `Connecting → Handshaking → {EncryptedHandshake |
//! PlaintextHandshake} → Established → Closed`. Protocol violations,
//! handshake mismatches, and idle timeouts all land in `Closed`; the session
//! may rediscover and redial the address later.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::protocol::{HandshakeCodec, MessageCodec, PeerHandshake, PeerId, PeerMessage};
use super::protocol::handshake::HANDSHAKE_LENGTH;
use crate::config::EncryptionPolicy;
use crate::torrent::piece_store::BLOCK_SIZE;
use crate::torrent::{InfoHash, TorrentError};

/// Upper bound on an incoming frame: a piece message carrying one block.
const MAX_MESSAGE_LENGTH: u32 = BLOCK_SIZE + 9 + 1024;

/// Interval between keep-alive messages on a quiet connection.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Lifecycle of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Connecting,
    Handshaking,
    EncryptedHandshake,
    PlaintextHandshake,
    Established,
    Closed,
}

/// An established wire connection to one peer.
pub struct PeerWire {
    stream: TcpStream,
    address: SocketAddr,
    phase: ConnectionPhase,
    encrypted: bool,
    remote_id: PeerId,
}

impl PeerWire {
    /// Dials a peer and completes the handshake.
    ///
    /// We offer a cipher unless the policy is `Allow`; the stream is
    /// encrypted when both sides offered. Under `Require` a peer that did not
    /// offer is rejected before any message flows.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Dial or socket I/O failed
    /// - `TorrentError::ProtocolViolation` - Bad protocol string or info hash mismatch
    /// - `TorrentError::EncryptionPolicyViolation` - Plaintext peer under `Require`
    pub async fn connect(
        address: SocketAddr,
        info_hash: InfoHash,
        our_id: PeerId,
        policy: EncryptionPolicy,
        timeout: Duration,
    ) -> Result<Self, TorrentError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TorrentError::PeerConnectionError {
                reason: format!("connect to {address} timed out"),
            })?
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("connect to {address} failed: {e}"),
            })?;

        let mut wire = Self {
            stream,
            address,
            phase: ConnectionPhase::Handshaking,
            encrypted: false,
            remote_id: PeerId::new([0u8; 20]),
        };

        let offer_crypto = policy != EncryptionPolicy::Allow;
        let mut handshake = PeerHandshake::new(info_hash, our_id);
        if offer_crypto {
            handshake = handshake.with_crypto_offer();
        }

        let result = tokio::time::timeout(
            timeout,
            wire.exchange_handshake(&handshake, info_hash, policy, offer_crypto),
        )
        .await
        .map_err(|_| TorrentError::PeerConnectionError {
            reason: format!("handshake with {address} timed out"),
        })?;

        match result {
            Ok(()) => Ok(wire),
            Err(e) => {
                wire.phase = ConnectionPhase::Closed;
                Err(e)
            }
        }
    }

    async fn exchange_handshake(
        &mut self,
        ours: &PeerHandshake,
        info_hash: InfoHash,
        policy: EncryptionPolicy,
        we_offered: bool,
    ) -> Result<(), TorrentError> {
        let wire_bytes = HandshakeCodec::serialize_handshake(ours);
        self.stream
            .write_all(&wire_bytes)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("handshake send failed: {e}"),
            })?;

        let mut response = [0u8; HANDSHAKE_LENGTH];
        self.stream
            .read_exact(&mut response)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("handshake read failed: {e}"),
            })?;

        let theirs = HandshakeCodec::deserialize_handshake(&response)?;

        if theirs.protocol != "BitTorrent protocol" {
            return Err(TorrentError::ProtocolViolation {
                reason: format!("unexpected protocol string: {:?}", theirs.protocol),
            });
        }
        if theirs.info_hash != info_hash {
            return Err(TorrentError::ProtocolViolation {
                reason: format!(
                    "info hash mismatch: expected {info_hash}, got {}",
                    theirs.info_hash
                ),
            });
        }

        self.encrypted = we_offered && theirs.offers_crypto();
        self.phase = if self.encrypted {
            ConnectionPhase::EncryptedHandshake
        } else {
            ConnectionPhase::PlaintextHandshake
        };

        if policy == EncryptionPolicy::Require && !self.encrypted {
            return Err(TorrentError::EncryptionPolicyViolation {
                address: self.address,
            });
        }

        self.remote_id = theirs.peer_id;
        self.phase = ConnectionPhase::Established;
        Ok(())
    }

    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn remote_id(&self) -> PeerId {
        self.remote_id
    }

    /// Sends one wire message.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Connection lost or write failed
    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        let wire_bytes = MessageCodec::serialize_message(message);
        self.stream
            .write_all(&wire_bytes)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("send to {} failed: {e}", self.address),
            })
    }

    /// Receives the next wire message, reassembling the length-prefixed frame.
    ///
    /// # Errors
    ///
    /// - `TorrentError::PeerConnectionError` - Connection lost or read failed
    /// - `TorrentError::ProtocolViolation` - Oversized or malformed frame
    pub async fn receive_message(&mut self) -> Result<PeerMessage, TorrentError> {
        let mut length_prefix = [0u8; 4];
        self.stream
            .read_exact(&mut length_prefix)
            .await
            .map_err(|e| TorrentError::PeerConnectionError {
                reason: format!("read from {} failed: {e}", self.address),
            })?;

        let length = u32::from_be_bytes(length_prefix);
        if length > MAX_MESSAGE_LENGTH {
            return Err(TorrentError::ProtocolViolation {
                reason: format!("oversized frame: {length} bytes"),
            });
        }

        let mut frame = Vec::with_capacity(4 + length as usize);
        frame.extend_from_slice(&length_prefix);
        if length > 0 {
            let mut payload = vec![0u8; length as usize];
            self.stream.read_exact(&mut payload).await.map_err(|e| {
                TorrentError::PeerConnectionError {
                    reason: format!("read from {} failed: {e}", self.address),
                }
            })?;
            frame.extend_from_slice(&payload);
        }

        MessageCodec::deserialize_message(&frame)
    }

    /// Closes the connection.
    pub async fn close(mut self) {
        self.phase = ConnectionPhase::Closed;
        let _ = self.stream.shutdown().await;
    }
}

/// Event reported by a peer I/O task to its owning session.
#[derive(Debug)]
pub enum PeerTaskEvent {
    /// Handshake completed; the connection is established.
    Connected {
        info_hash: InfoHash,
        address: SocketAddr,
        encrypted: bool,
    },
    /// Dial or handshake failed before the connection was established.
    ConnectFailed {
        info_hash: InfoHash,
        address: SocketAddr,
        error: TorrentError,
    },
    /// A wire message arrived from the peer.
    Message {
        info_hash: InfoHash,
        address: SocketAddr,
        message: PeerMessage,
    },
    /// The connection closed (error, violation, or clean shutdown).
    Closed {
        info_hash: InfoHash,
        address: SocketAddr,
        reason: String,
    },
}

/// Handle to a spawned peer I/O task.
pub struct PeerTaskHandle {
    outgoing: mpsc::Sender<PeerMessage>,
    join: JoinHandle<()>,
}

impl PeerTaskHandle {
    /// Queues a message for the wire. Errors mean the task already exited.
    pub fn send(&self, message: PeerMessage) -> Result<(), TorrentError> {
        self.outgoing
            .try_send(message)
            .map_err(|_| TorrentError::PeerConnectionError {
                reason: "peer task gone".to_string(),
            })
    }

    /// Aborts the I/O task, dropping the connection.
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawns the I/O task for one outgoing peer connection.
///
/// The task dials, handshakes, then pumps messages both ways until the
/// connection dies, reporting everything through `events`.
pub fn spawn_peer_task(
    address: SocketAddr,
    info_hash: InfoHash,
    our_id: PeerId,
    policy: EncryptionPolicy,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<PeerTaskEvent>,
) -> PeerTaskHandle {
    let (outgoing_tx, outgoing_rx) = mpsc::channel(64);

    let join = tokio::spawn(async move {
        run_peer_io(
            address,
            info_hash,
            our_id,
            policy,
            connect_timeout,
            events,
            outgoing_rx,
        )
        .await;
    });

    PeerTaskHandle {
        outgoing: outgoing_tx,
        join,
    }
}

async fn run_peer_io(
    address: SocketAddr,
    info_hash: InfoHash,
    our_id: PeerId,
    policy: EncryptionPolicy,
    connect_timeout: Duration,
    events: mpsc::UnboundedSender<PeerTaskEvent>,
    mut outgoing: mpsc::Receiver<PeerMessage>,
) {
    let mut wire =
        match PeerWire::connect(address, info_hash, our_id, policy, connect_timeout).await {
            Ok(wire) => wire,
            Err(error) => {
                tracing::debug!("peer {address} connect failed: {error}");
                let _ = events.send(PeerTaskEvent::ConnectFailed {
                    info_hash,
                    address,
                    error,
                });
                return;
            }
        };

    let encrypted = wire.is_encrypted();
    if events
        .send(PeerTaskEvent::Connected {
            info_hash,
            address,
            encrypted,
        })
        .is_err()
    {
        wire.close().await;
        return;
    }

    let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keep_alive.reset();

    let reason = loop {
        tokio::select! {
            incoming = wire.receive_message() => {
                match incoming {
                    Ok(message) => {
                        if events.send(PeerTaskEvent::Message { info_hash, address, message }).is_err() {
                            break "session gone".to_string();
                        }
                    }
                    Err(error) => break error.to_string(),
                }
            }
            queued = outgoing.recv() => {
                match queued {
                    Some(message) => {
                        if let Err(error) = wire.send_message(&message).await {
                            break error.to_string();
                        }
                        keep_alive.reset();
                    }
                    None => break "session closed connection".to_string(),
                }
            }
            _ = keep_alive.tick() => {
                if let Err(error) = wire.send_message(&PeerMessage::KeepAlive).await {
                    break error.to_string();
                }
            }
        }
    };

    wire.close().await;
    let _ = events.send(PeerTaskEvent::Closed {
        info_hash,
        address,
        reason,
    });
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    /// Minimal remote side: accepts one connection and answers the handshake.
    async fn accept_and_handshake(
        listener: TcpListener,
        info_hash: InfoHash,
        offer_crypto: bool,
    ) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HANDSHAKE_LENGTH];
        stream.read_exact(&mut buf).await.unwrap();

        let mut reply = PeerHandshake::new(info_hash, PeerId::generate());
        if offer_crypto {
            reply = reply.with_crypto_offer();
        }
        stream
            .write_all(&HandshakeCodec::serialize_handshake(&reply))
            .await
            .unwrap();
        stream
    }

    #[tokio::test]
    async fn test_handshake_establishes_connection() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let remote = tokio::spawn(accept_and_handshake(listener, info_hash, true));

        let wire = PeerWire::connect(
            address,
            info_hash,
            PeerId::generate(),
            EncryptionPolicy::Prefer,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(wire.phase(), ConnectionPhase::Established);
        assert!(wire.is_encrypted());
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_is_violation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let remote = tokio::spawn(accept_and_handshake(
            listener,
            InfoHash::new([9u8; 20]),
            false,
        ));

        let result = PeerWire::connect(
            address,
            InfoHash::new([7u8; 20]),
            PeerId::generate(),
            EncryptionPolicy::Allow,
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(
            result,
            Err(TorrentError::ProtocolViolation { .. })
        ));
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_require_rejects_plaintext_peer() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let remote = tokio::spawn(accept_and_handshake(listener, info_hash, false));

        let result = PeerWire::connect(
            address,
            info_hash,
            PeerId::generate(),
            EncryptionPolicy::Require,
            Duration::from_secs(5),
        )
        .await;

        assert!(matches!(
            result,
            Err(TorrentError::EncryptionPolicyViolation { .. })
        ));
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_prefer_falls_back_to_plaintext() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let remote = tokio::spawn(accept_and_handshake(listener, info_hash, false));

        let wire = PeerWire::connect(
            address,
            info_hash,
            PeerId::generate(),
            EncryptionPolicy::Prefer,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(wire.phase(), ConnectionPhase::Established);
        assert!(!wire.is_encrypted());
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_exchange_over_wire() {
        let info_hash = InfoHash::new([7u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        let remote = tokio::spawn(async move {
            let mut stream = accept_and_handshake(listener, info_hash, false).await;
            let wire_bytes = MessageCodec::serialize_message(&PeerMessage::Unchoke);
            stream.write_all(&wire_bytes).await.unwrap();
            stream
        });

        let mut wire = PeerWire::connect(
            address,
            info_hash,
            PeerId::generate(),
            EncryptionPolicy::Allow,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        let message = wire.receive_message().await.unwrap();
        assert_eq!(message, PeerMessage::Unchoke);
        remote.await.unwrap();
    }
}
