//! Actor loop for the torrent session engine.
//!
//! One task owns all engine state. Commands arrive on a bounded channel;
//! spawned jobs (verification, announces, peer I/O) report back on internal
//! channels; a periodic tick drives scheduling. Processing everything on one
//! task serializes state mutation without locks.

use std::time::Duration;

use tokio::sync::mpsc;

use super::commands::EngineCommand;
use super::core::Engine;
use super::handle::EngineHandle;
use crate::config::UndertowConfig;

/// Scheduling tick cadence: queue promotion, tracker deadlines, request
/// refills, rechoke rounds.
const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Spawns the engine actor and returns its handle.
pub fn spawn_engine(config: UndertowConfig) -> EngineHandle {
    let (command_tx, command_rx) = mpsc::channel(100);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (peer_events_tx, peer_events_rx) = mpsc::unbounded_channel();

    let engine = Engine::new(config, events_tx, peer_events_tx);

    tokio::spawn(async move {
        run_actor_loop(engine, command_rx, events_rx, peer_events_rx).await;
    });

    EngineHandle::new(command_tx)
}

async fn run_actor_loop(
    mut engine: Engine,
    mut commands: mpsc::Receiver<EngineCommand>,
    mut events: mpsc::UnboundedReceiver<super::core::EngineEvent>,
    mut peer_events: mpsc::UnboundedReceiver<crate::torrent::peer::connection::PeerTaskEvent>,
) {
    tracing::debug!("engine actor started");
    let mut tick = tokio::time::interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        if !handle_command(&mut engine, command).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Some(event) = events.recv() => {
                engine.handle_event(event);
            }
            Some(event) = peer_events.recv() => {
                engine.handle_peer_event(event);
            }
            _ = tick.tick() => {
                engine.handle_tick();
            }
        }
    }

    engine.shutdown();
    tracing::debug!("engine actor stopped");
}

/// Handles one command. Returns false to stop the loop.
async fn handle_command(engine: &mut Engine, command: EngineCommand) -> bool {
    match command {
        EngineCommand::AddTorrentData { bytes, responder } => {
            let _ = responder.send(engine.add_torrent_data(&bytes).await);
        }
        EngineCommand::AddTorrentFile { path, responder } => {
            let _ = responder.send(engine.add_torrent_file(&path).await);
        }
        EngineCommand::AddMagnet {
            magnet_link,
            responder,
        } => {
            let _ = responder.send(engine.add_magnet(&magnet_link).await);
        }
        EngineCommand::AddTorrentMetadata {
            metadata,
            responder,
        } => {
            let _ = responder.send(engine.add_torrent_metadata(metadata));
        }
        EngineCommand::Remove {
            info_hash,
            delete_data,
            responder,
        } => {
            let _ = responder.send(engine.remove(info_hash, delete_data));
        }
        EngineCommand::Pause {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.pause(info_hash));
        }
        EngineCommand::Resume {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.resume(info_hash));
        }
        EngineCommand::Verify {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.verify(info_hash));
        }
        EngineCommand::SetLocation {
            info_hash,
            path,
            responder,
        } => {
            let _ = responder.send(engine.set_location(info_hash, path));
        }
        EngineCommand::SetLimits { limits, responder } => {
            engine.set_limits(limits);
            let _ = responder.send(());
        }
        EngineCommand::SetTorrentLimits {
            info_hash,
            download,
            upload,
            responder,
        } => {
            let _ = responder.send(engine.set_torrent_limits(info_hash, download, upload));
        }
        EngineCommand::SetSeedPolicy {
            info_hash,
            policy,
            responder,
        } => {
            let _ = responder.send(engine.set_seed_policy(info_hash, policy));
        }
        EngineCommand::MoveInQueue {
            info_hash,
            direction,
            responder,
        } => {
            let _ = responder.send(engine.move_in_queue(info_hash, direction));
        }
        EngineCommand::StartNow {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.start_now(info_hash));
        }
        EngineCommand::AskForMorePeers {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.ask_for_more_peers(info_hash));
        }
        EngineCommand::AddPeerCandidates {
            info_hash,
            source,
            addresses,
            responder,
        } => {
            let _ = responder.send(engine.add_peer_candidates(info_hash, source, addresses));
        }
        EngineCommand::DeliverBlock {
            info_hash,
            piece,
            offset,
            data,
            responder,
        } => {
            let _ = responder.send(engine.handle_block(info_hash, piece, offset, data));
        }
        EngineCommand::GetSession {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.session_snapshot(info_hash));
        }
        EngineCommand::GetSessions { responder } => {
            let _ = responder.send(engine.session_snapshots());
        }
        EngineCommand::GetPeers {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.peer_snapshots(info_hash));
        }
        EngineCommand::GetTrackers {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.tracker_snapshots(info_hash));
        }
        EngineCommand::GetStats { responder } => {
            let _ = responder.send(engine.stats());
        }
        EngineCommand::Shutdown { responder } => {
            tracing::debug!("engine actor shutting down");
            let _ = responder.send(());
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{InfoHash, TorrentError};

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let handle = spawn_engine(UndertowConfig::default());
        assert!(handle.is_running());

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.torrents, 0);

        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = handle.stats().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_actor_add_invalid_magnet() {
        let handle = spawn_engine(UndertowConfig::default());

        let result = handle.add_magnet("not-a-magnet").await;
        assert!(result.is_err());

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_unknown_torrent_lookup() {
        let handle = spawn_engine(UndertowConfig::default());

        let missing = InfoHash::new([0u8; 20]);
        let result = handle.session(missing).await;
        assert!(matches!(result, Err(TorrentError::TorrentNotFound { .. })));

        handle.shutdown().await.unwrap();
    }
}
