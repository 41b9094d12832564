//! Download queue and seeding-stop policy.
//!
//! At most `max_active_downloads` torrents download at once; the rest wait in
//! insertion order. Finishing, erroring, or pausing releases a slot and the
//! next queued torrent is promoted. "Start now" bypasses the cap entirely.

use std::collections::HashSet;
use std::time::Duration;

use crate::config::SessionLimits;
use crate::torrent::InfoHash;

/// Queue reordering commands from the control layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMove {
    Top,
    Up,
    Down,
    Bottom,
}

/// Download-slot gatekeeper shared by all torrents in the session.
#[derive(Debug)]
pub struct SessionQueue {
    /// Queue order; torrents not yet granted a download slot wait here.
    order: Vec<InfoHash>,
    /// Torrents holding a regular download slot.
    active: HashSet<InfoHash>,
    /// Torrents started via the cap bypass; they hold no regular slot.
    bypass: HashSet<InfoHash>,
    max_active_downloads: usize,
}

impl SessionQueue {
    /// Creates an empty queue with the given active-download cap.
    pub fn new(max_active_downloads: usize) -> Self {
        Self {
            order: Vec::new(),
            active: HashSet::new(),
            bypass: HashSet::new(),
            max_active_downloads,
        }
    }

    /// Registers a torrent at the back of the queue.
    pub fn enqueue(&mut self, info_hash: InfoHash) {
        if !self.order.contains(&info_hash) {
            self.order.push(info_hash);
        }
    }

    /// Removes a torrent from the queue and frees any slot it held.
    pub fn remove(&mut self, info_hash: InfoHash) {
        self.order.retain(|&h| h != info_hash);
        self.active.remove(&info_hash);
        self.bypass.remove(&info_hash);
    }

    /// True when the torrent may enter the downloading state right now.
    pub fn may_activate(&self, info_hash: InfoHash) -> bool {
        if self.bypass.contains(&info_hash) || self.active.contains(&info_hash) {
            return true;
        }
        if self.active.len() >= self.max_active_downloads {
            return false;
        }
        // Slots go to the frontmost waiting torrents.
        let free = self.max_active_downloads - self.active.len();
        self.order
            .iter()
            .filter(|h| !self.active.contains(h) && !self.bypass.contains(h))
            .take(free)
            .any(|&h| h == info_hash)
    }

    /// Grants the torrent its download slot.
    pub fn activate(&mut self, info_hash: InfoHash) {
        if !self.bypass.contains(&info_hash) {
            self.active.insert(info_hash);
        }
    }

    /// Releases the torrent's slot (finished, errored, or paused).
    pub fn deactivate(&mut self, info_hash: InfoHash) {
        self.active.remove(&info_hash);
        self.bypass.remove(&info_hash);
    }

    /// Starts the torrent immediately, ignoring the cap.
    pub fn start_now(&mut self, info_hash: InfoHash) {
        self.enqueue(info_hash);
        self.active.remove(&info_hash);
        self.bypass.insert(info_hash);
    }

    /// Next queued torrent eligible for a freed slot, in queue order.
    pub fn next_queued(&self) -> Option<InfoHash> {
        if self.active.len() >= self.max_active_downloads {
            return None;
        }
        self.order
            .iter()
            .find(|h| !self.active.contains(h) && !self.bypass.contains(h))
            .copied()
    }

    /// Applies a reorder command from the control layer.
    pub fn reorder(&mut self, info_hash: InfoHash, direction: QueueMove) {
        let Some(position) = self.order.iter().position(|&h| h == info_hash) else {
            return;
        };

        match direction {
            QueueMove::Top => {
                self.order.remove(position);
                self.order.insert(0, info_hash);
            }
            QueueMove::Up => {
                if position > 0 {
                    self.order.swap(position, position - 1);
                }
            }
            QueueMove::Down => {
                if position + 1 < self.order.len() {
                    self.order.swap(position, position + 1);
                }
            }
            QueueMove::Bottom => {
                self.order.remove(position);
                self.order.push(info_hash);
            }
        }
    }

    /// Torrents currently holding a regular download slot.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Queue position of a torrent (0 = front).
    pub fn position(&self, info_hash: InfoHash) -> Option<usize> {
        self.order.iter().position(|&h| h == info_hash)
    }

    pub fn set_max_active_downloads(&mut self, max: usize) {
        self.max_active_downloads = max;
    }
}

/// Per-torrent seeding stop conditions.
///
/// A torrent flagged `seed_regardless` ignores both thresholds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeedPolicy {
    pub seed_regardless: bool,
    /// Per-torrent ratio override; falls back to the session default.
    pub ratio_limit: Option<f64>,
    /// Per-torrent idle override; falls back to the session default.
    pub idle_limit: Option<Duration>,
}

impl SeedPolicy {
    /// Decides whether a seeding torrent should stop.
    ///
    /// `ratio` is uploaded/downloaded for the torrent; `idle` the time since
    /// any data moved in either direction.
    pub fn should_stop(&self, limits: &SessionLimits, ratio: f64, idle: Duration) -> bool {
        if self.seed_regardless {
            return false;
        }

        let ratio_limit = self.ratio_limit.or(limits.seed_ratio_limit);
        if let Some(limit) = ratio_limit {
            if ratio >= limit {
                return true;
            }
        }

        let idle_limit = self.idle_limit.or(limits.seed_idle_limit);
        if let Some(limit) = idle_limit {
            if idle >= limit {
                return true;
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(byte: u8) -> InfoHash {
        InfoHash::new([byte; 20])
    }

    #[test]
    fn test_cap_enforced_in_insertion_order() {
        let mut queue = SessionQueue::new(1);
        queue.enqueue(hash(1));
        queue.enqueue(hash(2));

        assert!(queue.may_activate(hash(1)));
        assert!(!queue.may_activate(hash(2)));

        queue.activate(hash(1));
        assert!(!queue.may_activate(hash(2)));
        assert_eq!(queue.active_count(), 1);
    }

    #[test]
    fn test_finish_promotes_next_in_order() {
        let mut queue = SessionQueue::new(1);
        queue.enqueue(hash(1));
        queue.enqueue(hash(2));
        queue.enqueue(hash(3));
        queue.activate(hash(1));

        queue.deactivate(hash(1));
        queue.remove(hash(1));
        assert_eq!(queue.next_queued(), Some(hash(2)));
    }

    #[test]
    fn test_start_now_ignores_cap() {
        let mut queue = SessionQueue::new(1);
        queue.enqueue(hash(1));
        queue.enqueue(hash(2));
        queue.activate(hash(1));

        queue.start_now(hash(2));
        assert!(queue.may_activate(hash(2)));
        // The bypassed torrent holds no regular slot
        assert_eq!(queue.active_count(), 1);
    }

    #[test]
    fn test_reorder_commands() {
        let mut queue = SessionQueue::new(4);
        for byte in 1..=4 {
            queue.enqueue(hash(byte));
        }

        queue.reorder(hash(4), QueueMove::Top);
        assert_eq!(queue.position(hash(4)), Some(0));

        queue.reorder(hash(4), QueueMove::Down);
        assert_eq!(queue.position(hash(4)), Some(1));

        queue.reorder(hash(4), QueueMove::Up);
        assert_eq!(queue.position(hash(4)), Some(0));

        queue.reorder(hash(4), QueueMove::Bottom);
        assert_eq!(queue.position(hash(4)), Some(3));
    }

    #[test]
    fn test_reorder_changes_promotion_order() {
        let mut queue = SessionQueue::new(1);
        queue.enqueue(hash(1));
        queue.enqueue(hash(2));
        queue.enqueue(hash(3));
        queue.activate(hash(1));

        queue.reorder(hash(3), QueueMove::Top);
        queue.deactivate(hash(1));
        queue.remove(hash(1));

        assert_eq!(queue.next_queued(), Some(hash(3)));
    }

    #[test]
    fn test_seed_ratio_stop() {
        let limits = SessionLimits {
            seed_ratio_limit: Some(2.0),
            ..Default::default()
        };
        let policy = SeedPolicy::default();

        assert!(!policy.should_stop(&limits, 1.9, Duration::ZERO));
        assert!(policy.should_stop(&limits, 2.0, Duration::ZERO));
    }

    #[test]
    fn test_seed_idle_stop() {
        let limits = SessionLimits {
            seed_idle_limit: Some(Duration::from_secs(1800)),
            ..Default::default()
        };
        let policy = SeedPolicy::default();

        assert!(!policy.should_stop(&limits, 0.0, Duration::from_secs(1799)));
        assert!(policy.should_stop(&limits, 0.0, Duration::from_secs(1800)));
    }

    #[test]
    fn test_seed_regardless_overrides_limits() {
        let limits = SessionLimits {
            seed_ratio_limit: Some(1.0),
            seed_idle_limit: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let policy = SeedPolicy {
            seed_regardless: true,
            ..Default::default()
        };

        assert!(!policy.should_stop(&limits, 99.0, Duration::from_secs(86400)));
    }

    #[test]
    fn test_per_torrent_override_beats_session_default() {
        let limits = SessionLimits {
            seed_ratio_limit: Some(4.0),
            ..Default::default()
        };
        let policy = SeedPolicy {
            ratio_limit: Some(1.0),
            ..Default::default()
        };

        assert!(policy.should_stop(&limits, 1.5, Duration::ZERO));
    }
}
