//! Session-wide bandwidth scheduling.
//!
//! One scheduler object owns every rate pool: the global caps, the
//! alternative caps that substitute for them inside the weekly schedule
//! window, and the per-torrent caps. Connections ask for quota before moving
//! bytes; grants within one tick are computed under a single lock so the
//! per-direction total never exceeds the active cap.

use std::collections::HashMap;

use chrono::{Datelike, Timelike};
use parking_lot::Mutex;

use super::token_bucket::TokenBucket;
use crate::config::SessionLimits;
use crate::torrent::InfoHash;

/// Transfer direction for quota accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Download,
    Upload,
}

/// One connection's quota ask for a scheduling tick.
#[derive(Debug, Clone)]
pub struct QuotaRequest {
    pub info_hash: InfoHash,
    pub direction: Direction,
    pub desired: u64,
}

#[derive(Debug, Default)]
struct DirectionBuckets {
    download: Option<TokenBucket>,
    upload: Option<TokenBucket>,
}

impl DirectionBuckets {
    fn from_caps(download: Option<u64>, upload: Option<u64>) -> Self {
        Self {
            download: download.map(TokenBucket::for_rate),
            upload: upload.map(TokenBucket::for_rate),
        }
    }

    fn get_mut(&mut self, direction: Direction) -> Option<&mut TokenBucket> {
        match direction {
            Direction::Download => self.download.as_mut(),
            Direction::Upload => self.upload.as_mut(),
        }
    }
}

struct Pools {
    limits: SessionLimits,
    normal: DirectionBuckets,
    alternative: DirectionBuckets,
    per_torrent: HashMap<InfoHash, DirectionBuckets>,
    /// Test hook: pin the alternative window on or off.
    schedule_override: Option<bool>,
}

impl Pools {
    fn alt_window_active(&self) -> bool {
        if let Some(pinned) = self.schedule_override {
            return pinned;
        }
        match &self.limits.alt_speed_schedule {
            Some(schedule) => {
                let now = chrono::Local::now();
                let minute_of_day = (now.hour() * 60 + now.minute()) as u16;
                schedule.is_active(now.weekday(), minute_of_day)
            }
            None => false,
        }
    }

    fn global_bucket(&mut self, direction: Direction, alt: bool) -> Option<&mut TokenBucket> {
        if alt {
            self.alternative.get_mut(direction)
        } else {
            self.normal.get_mut(direction)
        }
    }

    fn global_available(&mut self, direction: Direction, alt: bool) -> u64 {
        match self.global_bucket(direction, alt) {
            Some(bucket) => bucket.available_tokens(),
            None => u64::MAX, // Unlimited sentinel
        }
    }

    fn torrent_available(&mut self, info_hash: InfoHash, direction: Direction) -> u64 {
        match self
            .per_torrent
            .get_mut(&info_hash)
            .and_then(|buckets| buckets.get_mut(direction))
        {
            Some(bucket) => bucket.available_tokens(),
            None => u64::MAX,
        }
    }

    fn commit(&mut self, info_hash: InfoHash, direction: Direction, alt: bool, granted: u64) {
        if granted == 0 {
            return;
        }
        if let Some(bucket) = self.global_bucket(direction, alt) {
            bucket.consume(granted);
        }
        if let Some(bucket) = self
            .per_torrent
            .get_mut(&info_hash)
            .and_then(|buckets| buckets.get_mut(direction))
        {
            bucket.consume(granted);
        }
    }
}

/// The single owner of all rate-limit pools.
///
/// Shared across torrent sessions; every interaction goes through the
/// request/grant API, never through ambient counters.
pub struct BandwidthScheduler {
    inner: Mutex<Pools>,
}

impl BandwidthScheduler {
    /// Creates a scheduler from the session limits.
    pub fn new(limits: SessionLimits) -> Self {
        let normal = DirectionBuckets::from_caps(limits.download_limit, limits.upload_limit);
        let alternative =
            DirectionBuckets::from_caps(limits.alt_download_limit, limits.alt_upload_limit);
        Self {
            inner: Mutex::new(Pools {
                limits,
                normal,
                alternative,
                per_torrent: HashMap::new(),
                schedule_override: None,
            }),
        }
    }

    /// Replaces the session limits, rebuilding the global pools.
    pub fn set_limits(&self, limits: SessionLimits) {
        let mut pools = self.inner.lock();
        pools.normal = DirectionBuckets::from_caps(limits.download_limit, limits.upload_limit);
        pools.alternative =
            DirectionBuckets::from_caps(limits.alt_download_limit, limits.alt_upload_limit);
        pools.limits = limits;
    }

    /// Sets per-torrent caps; `None` caps mean the torrent rides the global
    /// pools alone.
    pub fn set_torrent_limits(
        &self,
        info_hash: InfoHash,
        download: Option<u64>,
        upload: Option<u64>,
    ) {
        let mut pools = self.inner.lock();
        if download.is_none() && upload.is_none() {
            pools.per_torrent.remove(&info_hash);
        } else {
            pools
                .per_torrent
                .insert(info_hash, DirectionBuckets::from_caps(download, upload));
        }
    }

    /// Drops a removed torrent's pools.
    pub fn remove_torrent(&self, info_hash: InfoHash) {
        self.inner.lock().per_torrent.remove(&info_hash);
    }

    /// True while the alternative caps are substituting for the normal ones.
    pub fn alt_window_active(&self) -> bool {
        self.inner.lock().alt_window_active()
    }

    /// Test/diagnostic hook: pin the alternative window on or off, or `None`
    /// to follow the schedule again.
    pub fn override_alt_window(&self, pinned: Option<bool>) {
        self.inner.lock().schedule_override = pinned;
    }

    /// Grants quota to a single requester.
    ///
    /// Equivalent to a one-request tick: global cap first, then the
    /// per-torrent cap.
    pub fn request_quota(&self, info_hash: InfoHash, direction: Direction, desired: u64) -> u64 {
        self.tick(&[QuotaRequest {
            info_hash,
            direction,
            desired,
        }])[0]
    }

    /// Grants quota to every requester of one scheduling tick atomically.
    ///
    /// Per direction, the grant total never exceeds whichever global cap is
    /// active. Scarce quota is split max-min: every requester gets an even
    /// share of what remains, with the largest asks absorbing the leftovers,
    /// so nobody is starved to zero while others are served.
    pub fn tick(&self, requests: &[QuotaRequest]) -> Vec<u64> {
        let mut pools = self.inner.lock();
        let alt = pools.alt_window_active();
        let mut grants = vec![0u64; requests.len()];

        for direction in [Direction::Download, Direction::Upload] {
            let indices: Vec<usize> = requests
                .iter()
                .enumerate()
                .filter(|(_, r)| r.direction == direction)
                .map(|(i, _)| i)
                .collect();
            if indices.is_empty() {
                continue;
            }

            // Per-torrent caps bound each ask before the shared pool splits.
            let desires: Vec<u64> = indices
                .iter()
                .map(|&i| {
                    let request = &requests[i];
                    request
                        .desired
                        .min(pools.torrent_available(request.info_hash, direction))
                })
                .collect();

            let available = pools.global_available(direction, alt);
            let shares = fair_shares(&desires, available);

            for (k, &i) in indices.iter().enumerate() {
                pools.commit(requests[i].info_hash, direction, alt, shares[k]);
                grants[i] = shares[k];
            }
        }

        grants
    }
}

/// Max-min fair split of `cap` across the requested amounts.
///
/// When the cap covers everything, everyone gets their ask. Otherwise the
/// requesters are served smallest-ask-first, each taking at most an even
/// share of what remains, so large asks cannot starve small ones.
fn fair_shares(desires: &[u64], cap: u64) -> Vec<u64> {
    let total: u64 = desires.iter().fold(0u64, |acc, &d| acc.saturating_add(d));
    if total <= cap {
        return desires.to_vec();
    }

    let mut order: Vec<usize> = (0..desires.len()).collect();
    order.sort_by_key(|&i| desires[i]);

    let mut shares = vec![0u64; desires.len()];
    let mut remaining = cap;
    for (served, &i) in order.iter().enumerate() {
        let requesters_left = (desires.len() - served) as u64;
        let even_share = remaining / requesters_left;
        let granted = desires[i].min(even_share);
        shares[i] = granted;
        remaining -= granted;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    fn limited(download: Option<u64>, upload: Option<u64>) -> BandwidthScheduler {
        BandwidthScheduler::new(SessionLimits {
            download_limit: download,
            upload_limit: upload,
            alt_download_limit: Some(1_000),
            alt_upload_limit: Some(500),
            ..Default::default()
        })
    }

    #[test]
    fn test_unlimited_grants_full_ask() {
        let scheduler = limited(None, None);
        let granted = scheduler.request_quota(hash(1), Direction::Download, 1_000_000);
        assert_eq!(granted, 1_000_000);
    }

    #[test]
    fn test_tick_sum_never_exceeds_cap() {
        let scheduler = limited(Some(10_000), None);

        let requests: Vec<QuotaRequest> = (0..5)
            .map(|i| QuotaRequest {
                info_hash: hash(i),
                direction: Direction::Download,
                desired: 4_000,
            })
            .collect();

        let grants = scheduler.tick(&requests);
        let total: u64 = grants.iter().sum();
        assert!(total <= 10_000, "granted {total} over a 10000 cap");
    }

    #[test]
    fn test_scarce_quota_starves_nobody() {
        let scheduler = limited(Some(9_000), None);

        let requests = vec![
            QuotaRequest {
                info_hash: hash(1),
                direction: Direction::Download,
                desired: 100_000,
            },
            QuotaRequest {
                info_hash: hash(2),
                direction: Direction::Download,
                desired: 2_000,
            },
            QuotaRequest {
                info_hash: hash(3),
                direction: Direction::Download,
                desired: 100_000,
            },
        ];

        let grants = scheduler.tick(&requests);
        // The small ask is served in full; the big asks split the rest evenly.
        assert_eq!(grants[1], 2_000);
        assert!(grants[0] > 0 && grants[2] > 0);
        assert_eq!(grants.iter().sum::<u64>(), 9_000);
    }

    #[test]
    fn test_per_torrent_cap_applies_after_global() {
        let scheduler = limited(Some(100_000), None);
        scheduler.set_torrent_limits(hash(1), Some(1_000), None);

        let granted = scheduler.request_quota(hash(1), Direction::Download, 50_000);
        assert_eq!(granted, 1_000);

        // Another torrent without its own cap rides the global pool freely
        let granted = scheduler.request_quota(hash(2), Direction::Download, 50_000);
        assert_eq!(granted, 50_000);
    }

    #[test]
    fn test_alt_window_substitutes_caps() {
        let scheduler = limited(Some(100_000), Some(100_000));

        scheduler.override_alt_window(Some(true));
        assert!(scheduler.alt_window_active());
        let granted = scheduler.request_quota(hash(1), Direction::Download, 100_000);
        assert_eq!(granted, 1_000); // alt_download_limit

        let granted = scheduler.request_quota(hash(1), Direction::Upload, 100_000);
        assert_eq!(granted, 500); // alt_upload_limit
    }

    #[test]
    fn test_alt_window_unlimited_sentinel() {
        let scheduler = BandwidthScheduler::new(SessionLimits {
            download_limit: Some(1_000),
            alt_download_limit: None, // No cap inside the window
            ..Default::default()
        });

        scheduler.override_alt_window(Some(true));
        let granted = scheduler.request_quota(hash(1), Direction::Download, 1_000_000);
        assert_eq!(granted, 1_000_000);
    }

    #[test]
    fn test_directions_accounted_independently() {
        let scheduler = limited(Some(5_000), Some(100));

        let down = scheduler.request_quota(hash(1), Direction::Download, 5_000);
        let up = scheduler.request_quota(hash(1), Direction::Upload, 5_000);
        assert_eq!(down, 5_000);
        assert_eq!(up, 100);
    }

    #[test]
    fn test_fair_shares_exact_split() {
        assert_eq!(fair_shares(&[10, 10, 10], 100), vec![10, 10, 10]);
        assert_eq!(fair_shares(&[50, 50], 60), vec![30, 30]);
        let shares = fair_shares(&[5, 100, 100], 65);
        assert_eq!(shares[0], 5);
        assert_eq!(shares.iter().sum::<u64>(), 65);
    }
}
