//! Tracker scheduling scenarios: error backoff, backup rotation, and forced
//! announces, driven through the tier state machine the engine uses.

use std::time::{Duration, Instant};

use undertow_core::torrent::tracker::{TrackerStatus, TrackerTier, MAX_CONSECUTIVE_TIMEOUTS};

fn tier(urls: &[&str]) -> TrackerTier {
    TrackerTier::new(
        urls.iter().map(|s| s.to_string()).collect(),
        Duration::from_secs(300),
        Duration::from_secs(3600),
    )
}

#[tokio::test]
async fn test_three_errors_then_success_resumes_normal_interval() {
    let mut tier = tier(&["http://tracker.example/announce"]);
    let base = Instant::now();

    let mut delays = Vec::new();
    for round in 0..3 {
        tier.begin_announce().unwrap();
        tier.record_error(base, format!("temporarily refused {round}"));
        assert!(matches!(tier.last_result(), TrackerStatus::Error(_)));
        delays.push(tier.snapshot(base).seconds_until_announce);
    }

    // Exactly three scheduled retries with increasing backoff
    assert_eq!(delays.len(), 3);
    assert!(delays[0] < delays[1] && delays[1] < delays[2]);
    assert_eq!(delays, vec![15, 30, 60]);

    // A success returns the tier to the tracker-supplied interval
    tier.begin_announce().unwrap();
    tier.record_success(base, 1800, None);
    assert_eq!(*tier.last_result(), TrackerStatus::Ok);
    assert_eq!(tier.snapshot(base).seconds_until_announce, 1800);
}

#[tokio::test]
async fn test_timeout_rotation_reaches_backup_before_unreachable() {
    let mut tier = tier(&[
        "http://primary.example/announce",
        "http://backup.example/announce",
    ]);
    let now = Instant::now();

    for _ in 0..MAX_CONSECUTIVE_TIMEOUTS {
        tier.begin_announce().unwrap();
        tier.record_timeout(now);
    }
    assert_eq!(tier.active_url(), Some("http://backup.example/announce"));
    assert!(!tier.is_unreachable());

    // The backup answering clears the failure standing entirely
    tier.begin_announce().unwrap();
    tier.record_success(now, 600, None);
    assert_eq!(tier.consecutive_failures(), 0);
    assert_eq!(*tier.last_result(), TrackerStatus::Ok);
}

#[tokio::test]
async fn test_forced_announce_queued_behind_in_flight_request() {
    let mut tier = tier(&["http://tracker.example/announce"]);
    let now = Instant::now();

    let url = tier.begin_announce().unwrap();
    assert_eq!(url, "http://tracker.example/announce");

    // "Ask for more peers" while a request is in flight queues exactly one
    // follow-up announce
    tier.force_announce(now);
    assert!(tier.begin_announce().is_none());

    tier.record_success(now, 1800, None);
    assert!(tier.announce_due(now));
    tier.begin_announce().unwrap();
    tier.record_success(now, 1800, None);

    // The queued force fired once; the schedule is back to normal
    assert!(!tier.announce_due(now + Duration::from_secs(1)));
}
