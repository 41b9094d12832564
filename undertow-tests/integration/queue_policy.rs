//! Download queue scenarios: the active-download cap, promotion order, and
//! the start-now bypass.

use undertow_core::engine::{spawn_engine, TorrentState};
use undertow_core::torrent::PieceIndex;

use crate::common::{fixture_torrent, test_config, wait_for_state};

#[tokio::test]
async fn test_second_torrent_queued_until_first_seeds() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 1));

    let (first, first_pieces) = fixture_torrent(10, 2, 64);
    let (second, _) = fixture_torrent(11, 2, 64);

    let first_hash = handle.add_torrent_metadata(first).await.unwrap();
    wait_for_state(&handle, first_hash, TorrentState::Downloading).await;

    let second_hash = handle.add_torrent_metadata(second).await.unwrap();
    wait_for_state(&handle, second_hash, TorrentState::QueuedForDownload).await;

    // The cap holds for as long as the first torrent downloads
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    assert_eq!(
        handle.session(second_hash).await.unwrap().state,
        TorrentState::QueuedForDownload
    );

    // Finishing the first frees its slot for the second
    for (index, piece) in first_pieces.iter().enumerate() {
        handle
            .deliver_block(first_hash, PieceIndex::new(index as u32), 0, piece.clone())
            .await
            .unwrap();
    }
    wait_for_state(&handle, first_hash, TorrentState::Seeding).await;
    wait_for_state(&handle, second_hash, TorrentState::Downloading).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_downloading_count_never_exceeds_cap() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 2));

    let mut hashes = Vec::new();
    for seed in 20..25 {
        let (metadata, _) = fixture_torrent(seed, 2, 64);
        hashes.push(handle.add_torrent_metadata(metadata).await.unwrap());
    }

    // Let scans finish and the queue settle, then sample repeatedly
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    for _ in 0..10 {
        let sessions = handle.sessions().await.unwrap();
        let downloading = sessions
            .iter()
            .filter(|s| s.state == TorrentState::Downloading)
            .count();
        assert!(downloading <= 2, "{downloading} torrents downloading");
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_now_bypasses_cap() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 1));

    let (first, _) = fixture_torrent(30, 2, 64);
    let (second, _) = fixture_torrent(31, 2, 64);

    let first_hash = handle.add_torrent_metadata(first).await.unwrap();
    wait_for_state(&handle, first_hash, TorrentState::Downloading).await;

    let second_hash = handle.add_torrent_metadata(second).await.unwrap();
    wait_for_state(&handle, second_hash, TorrentState::QueuedForDownload).await;

    handle.start_now(second_hash).await.unwrap();
    wait_for_state(&handle, second_hash, TorrentState::Downloading).await;
    // The bypass does not evict the regular slot holder
    assert_eq!(
        handle.session(first_hash).await.unwrap().state,
        TorrentState::Downloading
    );

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_queue_reorder_changes_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn_engine(test_config(&dir, 1));

    let (first, first_pieces) = fixture_torrent(40, 2, 64);
    let (second, _) = fixture_torrent(41, 2, 64);
    let (third, _) = fixture_torrent(42, 2, 64);

    let first_hash = handle.add_torrent_metadata(first).await.unwrap();
    wait_for_state(&handle, first_hash, TorrentState::Downloading).await;

    let second_hash = handle.add_torrent_metadata(second).await.unwrap();
    wait_for_state(&handle, second_hash, TorrentState::QueuedForDownload).await;
    let third_hash = handle.add_torrent_metadata(third).await.unwrap();
    wait_for_state(&handle, third_hash, TorrentState::QueuedForDownload).await;

    // Move the third torrent to the front of the waiting line
    handle
        .move_in_queue(third_hash, undertow_core::torrent::QueueMove::Top)
        .await
        .unwrap();

    for (index, piece) in first_pieces.iter().enumerate() {
        handle
            .deliver_block(first_hash, PieceIndex::new(index as u32), 0, piece.clone())
            .await
            .unwrap();
    }
    wait_for_state(&handle, first_hash, TorrentState::Seeding).await;

    wait_for_state(&handle, third_hash, TorrentState::Downloading).await;
    assert_eq!(
        handle.session(second_hash).await.unwrap().state,
        TorrentState::QueuedForDownload
    );

    handle.shutdown().await.unwrap();
}
