//! End-to-end lifecycle scenarios: verify, download, checksum failure
//! recovery, pause/resume.

use undertow_core::engine::{spawn_engine, TorrentState};
use undertow_core::torrent::{PieceIndex, BLOCK_SIZE};

use crate::common::{fixture_torrent, test_config, wait_for, wait_for_state};

/// Delivers every block of one piece, optionally corrupting the final block.
async fn deliver_piece(
    handle: &undertow_core::EngineHandle,
    info_hash: undertow_core::InfoHash,
    piece: u32,
    bytes: &[u8],
    corrupt_final_block: bool,
) {
    let mut offset = 0u32;
    while (offset as usize) < bytes.len() {
        let end = (offset as usize + BLOCK_SIZE as usize).min(bytes.len());
        let mut block = bytes[offset as usize..end].to_vec();
        let is_final = end == bytes.len();
        if corrupt_final_block && is_final {
            for byte in &mut block {
                *byte ^= 0xFF;
            }
        }
        handle
            .deliver_block(info_hash, PieceIndex::new(piece), offset, block)
            .await
            .expect("block within layout");
        offset = end as u32;
    }
}

#[tokio::test]
async fn test_add_verify_download_seed_sequence() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 4));
    let (metadata, pieces) = fixture_torrent(1, 4, 64);

    let info_hash = handle.add_torrent_metadata(metadata).await.unwrap();

    // Fresh add goes through verification into the download queue
    wait_for_state(&handle, info_hash, TorrentState::Downloading).await;

    for (index, piece) in pieces.iter().enumerate() {
        deliver_piece(&handle, info_hash, index as u32, piece, false).await;
    }

    wait_for_state(&handle, info_hash, TorrentState::Seeding).await;
    let snapshot = handle.session(info_hash).await.unwrap();
    assert_eq!(snapshot.bytes_have, snapshot.total_size);
    assert_eq!(snapshot.progress, 1.0);
    assert_eq!(snapshot.bytes_left, 0);
    assert_eq!(snapshot.discarded_bytes, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupted_final_block_discards_piece_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 4));
    // Two blocks per piece so the final block is a distinct delivery
    let piece_length = 2 * BLOCK_SIZE;
    let (metadata, pieces) = fixture_torrent(2, 4, piece_length);

    let info_hash = handle.add_torrent_metadata(metadata).await.unwrap();
    wait_for_state(&handle, info_hash, TorrentState::Downloading).await;

    for (index, piece) in pieces.iter().enumerate() {
        let corrupt = index == 2;
        deliver_piece(&handle, info_hash, index as u32, piece, corrupt).await;
    }

    // Piece 2 fails its checksum: the whole piece is discarded, no partial
    // credit retained, and the torrent keeps downloading.
    wait_for(&handle, info_hash, |s| {
        s.discarded_bytes == piece_length as u64 && s.bytes_have == 3 * piece_length as u64
    })
    .await;
    let snapshot = handle.session(info_hash).await.unwrap();
    assert_eq!(snapshot.state, TorrentState::Downloading);
    assert_eq!(snapshot.bytes_have, 3 * piece_length as u64);
    assert!(snapshot
        .last_error
        .as_deref()
        .unwrap()
        .contains("failed checksum"));

    // The piece is re-requestable; a clean retry completes the torrent
    deliver_piece(&handle, info_hash, 2, &pieces[2], false).await;
    wait_for_state(&handle, info_hash, TorrentState::Seeding).await;
    let snapshot = handle.session(info_hash).await.unwrap();
    assert_eq!(snapshot.bytes_have, snapshot.total_size);
    assert_eq!(snapshot.discarded_bytes, piece_length as u64);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_suspends_and_resume_restores() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 4));
    let (metadata, pieces) = fixture_torrent(3, 4, 64);

    let info_hash = handle.add_torrent_metadata(metadata).await.unwrap();
    wait_for_state(&handle, info_hash, TorrentState::Downloading).await;

    deliver_piece(&handle, info_hash, 0, &pieces[0], false).await;
    wait_for(&handle, info_hash, |s| s.bytes_have == 64).await;

    handle.pause(info_hash).await.unwrap();
    let snapshot = handle.session(info_hash).await.unwrap();
    assert!(snapshot.state.is_paused());
    // Piece and bitmap state preserved across the pause
    assert_eq!(snapshot.bytes_have, 64);

    handle.resume(info_hash).await.unwrap();
    wait_for_state(&handle, info_hash, TorrentState::Downloading).await;

    for index in 1..4 {
        deliver_piece(&handle, info_hash, index as u32, &pieces[index], false).await;
    }
    wait_for_state(&handle, info_hash, TorrentState::Seeding).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_add_names_existing_torrent() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 4));
    let (metadata, _) = fixture_torrent(4, 2, 64);
    let info_hash = metadata.info_hash;

    handle.add_torrent_metadata(metadata.clone()).await.unwrap();
    let error = handle.add_torrent_metadata(metadata).await.unwrap_err();
    match error {
        undertow_core::TorrentError::DuplicateTorrent { info_hash: existing } => {
            assert_eq!(existing, info_hash);
        }
        other => panic!("expected DuplicateTorrent, got {other}"),
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remove_with_data_deletion() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 4));
    let (metadata, pieces) = fixture_torrent(5, 2, 64);
    let name = metadata.name.clone();

    let info_hash = handle.add_torrent_metadata(metadata).await.unwrap();
    wait_for_state(&handle, info_hash, TorrentState::Downloading).await;
    for (index, piece) in pieces.iter().enumerate() {
        deliver_piece(&handle, info_hash, index as u32, piece, false).await;
    }
    wait_for_state(&handle, info_hash, TorrentState::Seeding).await;
    assert!(dir.path().join(&name).exists());

    handle.remove(info_hash, true).await.unwrap();
    let result = handle.session(info_hash).await;
    assert!(result.is_err());

    // Deletion runs asynchronously after removal
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while dir.path().join(&name).exists() {
        assert!(tokio::time::Instant::now() < deadline, "data not deleted");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    handle.shutdown().await.unwrap();
}
