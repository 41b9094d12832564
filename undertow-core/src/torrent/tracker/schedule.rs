//! Per-tier announce scheduling: retry backoff, backup URL rotation, forced
//! announces, and the independent scrape cadence.
//!
//! Each tracker tier holds a primary URL and its backups. One URL is active
//! at a time; repeated timeouts rotate to the next backup before the whole
//! tier is reported unreachable. Error responses keep the active URL and back
//! off. The backoff curve is a tunable, not a protocol contract.

use std::time::{Duration, Instant};

/// Consecutive timeouts of the active URL before rotating to a backup.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// First retry delay after a failure; doubles per consecutive failure.
const BACKOFF_BASE: Duration = Duration::from_secs(15);

/// Retry delay ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(3600);

/// Scrape runs this many times slower than the announce floor.
const SCRAPE_CADENCE_FACTOR: u32 = 10;

/// Last observed outcome for a tracker tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerStatus {
    /// No announce attempted yet
    Idle,
    /// Last announce succeeded
    Ok,
    /// Last announce succeeded but carried a warning
    Warning(String),
    /// Tracker answered with an error message
    Error(String),
    /// Last announce timed out
    Timeout,
    /// Every URL in the tier failed a full rotation
    Unreachable,
}

impl TrackerStatus {
    /// Status text surfaced to the control layer.
    pub fn as_text(&self) -> String {
        match self {
            TrackerStatus::Idle => "idle".to_string(),
            TrackerStatus::Ok => "ok".to_string(),
            TrackerStatus::Warning(text) => format!("warning: {text}"),
            TrackerStatus::Error(text) => format!("error: {text}"),
            TrackerStatus::Timeout => "timed out".to_string(),
            TrackerStatus::Unreachable => "unreachable".to_string(),
        }
    }
}

/// Announce request lifecycle for the tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnnounceState {
    Idle,
    Announcing,
}

/// Plain-data view of a tier for status snapshots.
#[derive(Debug, Clone)]
pub struct TrackerSnapshot {
    pub url: String,
    pub status: TrackerStatus,
    pub consecutive_failures: u32,
    pub seconds_until_announce: u64,
}

/// Announce/scrape scheduling state for one tracker tier.
pub struct TrackerTier {
    urls: Vec<String>,
    active: usize,
    state: AnnounceState,
    /// Timeouts of the active URL since it last answered.
    consecutive_failures: u32,
    /// URLs exhausted in the current failover pass.
    rotations: u32,
    /// Failures since the last success, drives the backoff exponent.
    backoff_level: u32,
    last_result: TrackerStatus,
    next_announce: Instant,
    next_scrape: Instant,
    forced_pending: bool,
    min_interval: Duration,
    max_interval: Duration,
}

impl TrackerTier {
    /// Creates a tier whose first announce is due immediately.
    pub fn new(urls: Vec<String>, min_interval: Duration, max_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            urls,
            active: 0,
            state: AnnounceState::Idle,
            consecutive_failures: 0,
            rotations: 0,
            backoff_level: 0,
            last_result: TrackerStatus::Idle,
            next_announce: now,
            next_scrape: now,
            forced_pending: false,
            min_interval,
            max_interval,
        }
    }

    /// URL currently selected within the tier.
    pub fn active_url(&self) -> Option<&str> {
        self.urls.get(self.active).map(String::as_str)
    }

    pub fn last_result(&self) -> &TrackerStatus {
        &self.last_result
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self.last_result, TrackerStatus::Unreachable)
    }

    /// True when an announce should be started now.
    pub fn announce_due(&self, now: Instant) -> bool {
        self.state == AnnounceState::Idle && !self.urls.is_empty() && now >= self.next_announce
    }

    /// Marks an announce as in flight and returns the URL to hit.
    pub fn begin_announce(&mut self) -> Option<String> {
        if self.state == AnnounceState::Announcing {
            return None;
        }
        let url = self.active_url()?.to_string();
        self.state = AnnounceState::Announcing;
        Some(url)
    }

    /// Records a successful announce and schedules the next one.
    ///
    /// The tracker-supplied interval is clamped to the configured bounds. A
    /// success resets failure counters and clears unreachable standing. A
    /// forced announce that arrived mid-flight runs immediately.
    pub fn record_success(&mut self, now: Instant, interval_secs: u32, warning: Option<String>) {
        self.state = AnnounceState::Idle;
        self.consecutive_failures = 0;
        self.rotations = 0;
        self.backoff_level = 0;
        self.last_result = match warning {
            Some(text) => TrackerStatus::Warning(text),
            None => TrackerStatus::Ok,
        };

        let interval = Duration::from_secs(interval_secs as u64)
            .max(self.min_interval)
            .min(self.max_interval);
        self.next_announce = if self.forced_pending {
            self.forced_pending = false;
            now
        } else {
            now + interval
        };
    }

    /// Records a timed-out announce.
    ///
    /// After `MAX_CONSECUTIVE_TIMEOUTS` the active URL is abandoned and the
    /// next backup in the tier takes over; when a full pass over every URL
    /// fails, the tier is reported unreachable but retries continue under
    /// the capped backoff.
    pub fn record_timeout(&mut self, now: Instant) {
        self.state = AnnounceState::Idle;
        self.consecutive_failures += 1;
        self.backoff_level += 1;
        self.last_result = TrackerStatus::Timeout;

        if self.consecutive_failures >= MAX_CONSECUTIVE_TIMEOUTS {
            self.consecutive_failures = 0;
            self.rotations += 1;
            if !self.urls.is_empty() {
                self.active = (self.active + 1) % self.urls.len();
            }
            if self.rotations >= self.urls.len() as u32 {
                self.last_result = TrackerStatus::Unreachable;
                tracing::warn!("tracker tier unreachable: {:?}", self.urls);
            } else {
                tracing::debug!(
                    "tracker timeout, rotating to backup {:?}",
                    self.active_url()
                );
            }
        }

        self.next_announce = now + self.backoff_delay();
        self.forced_pending = false;
    }

    /// Records an error response. The error text is surfaced as status; the
    /// active URL is kept and retried with increasing backoff.
    pub fn record_error(&mut self, now: Instant, message: String) {
        self.state = AnnounceState::Idle;
        self.backoff_level += 1;
        self.last_result = TrackerStatus::Error(message);
        self.next_announce = now + self.backoff_delay();
        self.forced_pending = false;
    }

    /// Requests an immediate announce ("ask for more peers").
    ///
    /// Bypasses the schedule unless an announce is already in flight, in
    /// which case one follow-up is queued to run when it completes.
    pub fn force_announce(&mut self, now: Instant) {
        match self.state {
            AnnounceState::Announcing => self.forced_pending = true,
            AnnounceState::Idle => self.next_announce = now,
        }
    }

    /// Current retry delay: 15s doubling per failure, capped at an hour.
    fn backoff_delay(&self) -> Duration {
        let exponent = self.backoff_level.saturating_sub(1).min(16);
        (BACKOFF_BASE * 2u32.pow(exponent)).min(BACKOFF_CAP)
    }

    /// True when a scrape should run; scrapes follow their own coarser clock.
    pub fn scrape_due(&self, now: Instant) -> bool {
        !self.urls.is_empty() && now >= self.next_scrape
    }

    /// Schedules the next scrape.
    pub fn record_scrape(&mut self, now: Instant) {
        self.next_scrape = now + self.min_interval * SCRAPE_CADENCE_FACTOR;
    }

    /// Plain-data view for the control layer.
    pub fn snapshot(&self, now: Instant) -> TrackerSnapshot {
        TrackerSnapshot {
            url: self.active_url().unwrap_or_default().to_string(),
            status: self.last_result.clone(),
            consecutive_failures: self.consecutive_failures,
            seconds_until_announce: self
                .next_announce
                .saturating_duration_since(now)
                .as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(urls: &[&str]) -> TrackerTier {
        TrackerTier::new(
            urls.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(300),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_first_announce_due_immediately() {
        let tier = tier(&["http://a/announce"]);
        assert!(tier.announce_due(Instant::now()));
    }

    #[test]
    fn test_success_schedules_clamped_interval() {
        let mut tier = tier(&["http://a/announce"]);
        let now = Instant::now();

        tier.begin_announce().unwrap();
        tier.record_success(now, 60, None); // Below the 300s floor

        assert_eq!(*tier.last_result(), TrackerStatus::Ok);
        assert!(!tier.announce_due(now + Duration::from_secs(299)));
        assert!(tier.announce_due(now + Duration::from_secs(300)));
    }

    #[test]
    fn test_timeouts_rotate_to_backup_before_unreachable() {
        let mut tier = tier(&["http://primary/announce", "http://backup/announce"]);
        let now = Instant::now();

        for _ in 0..MAX_CONSECUTIVE_TIMEOUTS {
            tier.begin_announce().unwrap();
            tier.record_timeout(now);
        }

        // Rotated to the backup, tier not yet written off
        assert_eq!(tier.active_url(), Some("http://backup/announce"));
        assert!(!tier.is_unreachable());

        for _ in 0..MAX_CONSECUTIVE_TIMEOUTS {
            tier.begin_announce().unwrap();
            tier.record_timeout(now);
        }

        // Full pass failed
        assert!(tier.is_unreachable());
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let mut tier = tier(&["http://a/announce", "http://b/announce"]);
        let now = Instant::now();

        tier.begin_announce().unwrap();
        tier.record_timeout(now);
        tier.begin_announce().unwrap();
        tier.record_timeout(now);
        assert_eq!(tier.consecutive_failures(), 2);

        tier.begin_announce().unwrap();
        tier.record_success(now, 600, None);
        assert_eq!(tier.consecutive_failures(), 0);
        assert!(!tier.is_unreachable());
    }

    #[test]
    fn test_error_backoff_increases_then_interval_resumes() {
        let mut tier = tier(&["http://a/announce"]);
        let base = Instant::now();

        // Three consecutive error responses with growing retry delays
        let mut previous_delay = Duration::ZERO;
        for round in 0..3 {
            tier.begin_announce().unwrap();
            tier.record_error(base, format!("boom {round}"));

            let snapshot = tier.snapshot(base);
            let delay = Duration::from_secs(snapshot.seconds_until_announce);
            assert!(delay > previous_delay, "backoff must grow per retry");
            previous_delay = delay;

            // Error text is surfaced, URL unchanged
            assert!(matches!(tier.last_result(), TrackerStatus::Error(_)));
            assert_eq!(tier.active_url(), Some("http://a/announce"));
        }

        // 15s, 30s, 60s with the documented curve
        assert_eq!(previous_delay, Duration::from_secs(60));

        tier.begin_announce().unwrap();
        tier.record_success(base, 1800, None);
        let snapshot = tier.snapshot(base);
        assert_eq!(snapshot.seconds_until_announce, 1800);
    }

    #[test]
    fn test_force_announce_bypasses_schedule() {
        let mut tier = tier(&["http://a/announce"]);
        let now = Instant::now();

        tier.begin_announce().unwrap();
        tier.record_success(now, 1800, None);
        assert!(!tier.announce_due(now + Duration::from_secs(1)));

        tier.force_announce(now + Duration::from_secs(1));
        assert!(tier.announce_due(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_force_announce_queued_while_in_flight() {
        let mut tier = tier(&["http://a/announce"]);
        let now = Instant::now();

        tier.begin_announce().unwrap();
        tier.force_announce(now); // queued, not immediate

        tier.record_success(now, 1800, None);
        // The queued force runs right away instead of waiting out the interval
        assert!(tier.announce_due(now));
    }

    #[test]
    fn test_warning_surfaced_as_status() {
        let mut tier = tier(&["http://a/announce"]);
        tier.begin_announce().unwrap();
        tier.record_success(Instant::now(), 1800, Some("truncated peer list".to_string()));

        assert_eq!(
            tier.last_result().as_text(),
            "warning: truncated peer list"
        );
    }

    #[test]
    fn test_scrape_runs_on_coarser_clock() {
        let mut tier = tier(&["http://a/announce"]);
        let now = Instant::now();

        assert!(tier.scrape_due(now));
        tier.record_scrape(now);
        assert!(!tier.scrape_due(now + Duration::from_secs(2999)));
        assert!(tier.scrape_due(now + Duration::from_secs(3000)));
    }
}
