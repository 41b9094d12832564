//! Bandwidth scheduler contracts: per-tick cap totals, fairness under
//! scarcity, and the alternative-limit window.

use undertow_core::config::SessionLimits;
use undertow_core::network::{BandwidthScheduler, Direction, QuotaRequest};
use undertow_core::torrent::InfoHash;

fn hash(byte: u8) -> InfoHash {
    InfoHash::new([byte; 20])
}

#[tokio::test]
async fn test_tick_grant_total_never_exceeds_active_cap() {
    let scheduler = BandwidthScheduler::new(SessionLimits {
        download_limit: Some(64_000),
        upload_limit: Some(16_000),
        ..Default::default()
    });

    let requests: Vec<QuotaRequest> = (0..8)
        .flat_map(|i| {
            [
                QuotaRequest {
                    info_hash: hash(i),
                    direction: Direction::Download,
                    desired: 50_000,
                },
                QuotaRequest {
                    info_hash: hash(i),
                    direction: Direction::Upload,
                    desired: 50_000,
                },
            ]
        })
        .collect();

    let grants = scheduler.tick(&requests);
    let down_total: u64 = requests
        .iter()
        .zip(&grants)
        .filter(|(r, _)| r.direction == Direction::Download)
        .map(|(_, g)| *g)
        .sum();
    let up_total: u64 = requests
        .iter()
        .zip(&grants)
        .filter(|(r, _)| r.direction == Direction::Upload)
        .map(|(_, g)| *g)
        .sum();

    assert!(down_total <= 64_000);
    assert!(up_total <= 16_000);
    // Scarce quota reaches every requester rather than starving some to zero
    assert!(grants.iter().all(|&g| g > 0));
}

#[tokio::test]
async fn test_alt_window_substitutes_global_caps() {
    let scheduler = BandwidthScheduler::new(SessionLimits {
        download_limit: Some(1_000_000),
        alt_download_limit: Some(10_000),
        alt_upload_limit: None, // Unlimited inside the window
        upload_limit: Some(5_000),
        ..Default::default()
    });

    // Outside the window the normal caps apply
    scheduler.override_alt_window(Some(false));
    assert_eq!(
        scheduler.request_quota(hash(1), Direction::Download, 500_000),
        500_000
    );
    assert_eq!(
        scheduler.request_quota(hash(1), Direction::Upload, 500_000),
        5_000
    );

    // Inside the window the alternative caps substitute, including the
    // unlimited sentinel for uploads
    scheduler.override_alt_window(Some(true));
    assert!(scheduler.alt_window_active());
    assert_eq!(
        scheduler.request_quota(hash(2), Direction::Download, 500_000),
        10_000
    );
    assert_eq!(
        scheduler.request_quota(hash(2), Direction::Upload, 500_000),
        500_000
    );
}

#[tokio::test]
async fn test_per_torrent_cap_layers_under_global() {
    let scheduler = BandwidthScheduler::new(SessionLimits {
        download_limit: Some(100_000),
        ..Default::default()
    });
    scheduler.set_torrent_limits(hash(1), Some(2_000), None);

    assert_eq!(
        scheduler.request_quota(hash(1), Direction::Download, 50_000),
        2_000
    );
    assert_eq!(
        scheduler.request_quota(hash(2), Direction::Download, 50_000),
        50_000
    );
}
