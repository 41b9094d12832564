//! Shared fixtures for integration tests.

use std::time::Duration;

use sha1::{Digest, Sha1};
use undertow_core::config::UndertowConfig;
use undertow_core::engine::{EngineHandle, TorrentState};
use undertow_core::torrent::{InfoHash, TorrentFile, TorrentMetadata};

pub fn sha1_of(bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Builds a single-file torrent whose piece data is derived from the seed,
/// returning the metadata plus the raw piece bytes to feed back in.
pub fn fixture_torrent(
    seed: u8,
    piece_count: usize,
    piece_length: u32,
) -> (TorrentMetadata, Vec<Vec<u8>>) {
    let pieces: Vec<Vec<u8>> = (0..piece_count)
        .map(|i| vec![seed.wrapping_add(i as u8); piece_length as usize])
        .collect();
    let total_length = piece_count as u64 * piece_length as u64;

    let metadata = TorrentMetadata {
        info_hash: InfoHash::new([seed; 20]),
        name: format!("fixture-{seed}.bin"),
        piece_length,
        piece_hashes: pieces.iter().map(|p| sha1_of(p)).collect(),
        total_length,
        files: vec![TorrentFile {
            path: vec![format!("fixture-{seed}.bin")],
            length: total_length,
        }],
        announce_tiers: vec![vec!["http://127.0.0.1:1/announce".to_string()]],
        private: false,
        comment: None,
        created_by: None,
        creation_date: None,
    };
    (metadata, pieces)
}

/// Engine config writing into a temp dir, with the given download-slot cap.
pub fn test_config(dir: &tempfile::TempDir, max_active_downloads: usize) -> UndertowConfig {
    let mut config = UndertowConfig::default();
    config.storage.download_dir = dir.path().to_path_buf();
    config.limits.max_active_downloads = max_active_downloads;
    config
}

/// Polls the engine until the torrent reaches the wanted state.
///
/// # Panics
/// Panics when the state is not reached within ten seconds.
pub async fn wait_for_state(handle: &EngineHandle, info_hash: InfoHash, want: TorrentState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.session(info_hash).await.expect("session lookup");
        if snapshot.state == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "torrent stuck in {:?}, wanted {:?}",
            snapshot.state,
            want
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Polls until the predicate on the session snapshot holds.
pub async fn wait_for<F>(handle: &EngineHandle, info_hash: InfoHash, mut predicate: F)
where
    F: FnMut(&undertow_core::SessionSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = handle.session(info_hash).await.expect("session lookup");
        if predicate(&snapshot) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached; state {:?}",
            snapshot.state
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
