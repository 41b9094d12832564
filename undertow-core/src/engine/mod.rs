//! Torrent session engine: actor model composition of the piece store,
//! peer management, tracker scheduling, bandwidth pools, and queue policy.
//!
//! The engine runs as a single actor task owning all per-torrent state.
//! `spawn_engine` starts it; `EngineHandle` is the cloneable async API the
//! control layer drives.

pub mod actor;
pub mod commands;
mod core;
pub mod handle;

pub use actor::spawn_engine;
pub use commands::{EngineCommand, EngineStats, PeerSnapshot, SessionSnapshot, TorrentState};
pub use handle::EngineHandle;
