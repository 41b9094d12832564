//! Peer discovery aggregation.
//!
//! Collects candidate addresses from trackers, DHT, peer exchange, local
//! peer discovery, and incoming connections; deduplicates by address and
//! hands ranked candidates back to the session, which performs the actual
//! connection attempts. No sockets are opened here.

use std::collections::HashMap;
use std::net::SocketAddr;

/// Where a peer address was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Lpd,
    Incoming,
}

impl PeerSource {
    /// Lower ranks are tried first. Tracker-sourced and incoming addresses
    /// are the most trustworthy; DHT results the most speculative.
    fn rank(self) -> u8 {
        match self {
            PeerSource::Incoming => 0,
            PeerSource::Tracker => 1,
            PeerSource::Pex => 2,
            PeerSource::Lpd => 2,
            PeerSource::Dht => 3,
        }
    }

    /// Side-channel sources are suppressed entirely for private torrents.
    fn is_side_channel(self) -> bool {
        matches!(self, PeerSource::Dht | PeerSource::Pex | PeerSource::Lpd)
    }
}

/// Give up on an address after this many failed connection attempts.
const MAX_CONNECT_ATTEMPTS: u32 = 3;

#[derive(Debug)]
struct Candidate {
    source: PeerSource,
    insertion: u64,
    attempts: u32,
    connected: bool,
}

/// Deduplicated pool of peer addresses for one torrent.
///
/// A private torrent only ever accepts tracker and incoming candidates.
#[derive(Debug)]
pub struct CandidatePool {
    candidates: HashMap<SocketAddr, Candidate>,
    private: bool,
    insertion_counter: u64,
}

impl CandidatePool {
    /// Creates a pool; `private` mirrors the torrent's private flag.
    pub fn new(private: bool) -> Self {
        Self {
            candidates: HashMap::new(),
            private,
            insertion_counter: 0,
        }
    }

    /// Adds candidate addresses from one discovery source.
    ///
    /// Duplicates keep their original source. Returns how many addresses
    /// were new. Side-channel sources are dropped for private torrents.
    pub fn add_candidates(
        &mut self,
        source: PeerSource,
        addresses: impl IntoIterator<Item = SocketAddr>,
    ) -> usize {
        if self.private && source.is_side_channel() {
            tracing::debug!("dropping {source:?} candidates for private torrent");
            return 0;
        }

        let mut added = 0;
        for address in addresses {
            if self.candidates.contains_key(&address) {
                continue;
            }
            self.insertion_counter += 1;
            self.candidates.insert(
                address,
                Candidate {
                    source,
                    insertion: self.insertion_counter,
                    attempts: 0,
                    connected: false,
                },
            );
            added += 1;
        }
        added
    }

    /// Returns up to `slots` ranked candidates and marks them attempted.
    ///
    /// Never surfaces more candidates than open connection slots remain;
    /// addresses currently connected, recently attempted this round, or past
    /// the retry cap are skipped. Ranking is source preference, then
    /// least-attempted, then discovery order.
    pub fn take_candidates(&mut self, slots: usize) -> Vec<SocketAddr> {
        if slots == 0 {
            return Vec::new();
        }

        let mut eligible: Vec<(&SocketAddr, &Candidate)> = self
            .candidates
            .iter()
            .filter(|(_, c)| !c.connected && c.attempts < MAX_CONNECT_ATTEMPTS)
            .collect();

        eligible.sort_by_key(|(_, c)| (c.source.rank(), c.attempts, c.insertion));

        let picked: Vec<SocketAddr> = eligible
            .into_iter()
            .take(slots)
            .map(|(address, _)| *address)
            .collect();

        for address in &picked {
            if let Some(candidate) = self.candidates.get_mut(address) {
                candidate.attempts += 1;
            }
        }
        picked
    }

    /// Marks an address as holding a live connection. At most one live
    /// connection per address at a time.
    pub fn mark_connected(&mut self, address: SocketAddr) {
        if let Some(candidate) = self.candidates.get_mut(&address) {
            candidate.connected = true;
            candidate.attempts = 0;
        }
    }

    /// Returns a disconnected address to the pool for a later retry.
    pub fn mark_disconnected(&mut self, address: SocketAddr) {
        if let Some(candidate) = self.candidates.get_mut(&address) {
            candidate.connected = false;
        }
    }

    /// Records a failed connection attempt.
    pub fn mark_failed(&mut self, address: SocketAddr) {
        if let Some(candidate) = self.candidates.get_mut(&address) {
            candidate.connected = false;
            if candidate.attempts >= MAX_CONNECT_ATTEMPTS {
                tracing::debug!("retiring peer candidate {address} after repeated failures");
            }
        }
    }

    /// Removes an address outright (e.g. banned after a protocol violation).
    pub fn remove(&mut self, address: SocketAddr) {
        self.candidates.remove(&address);
    }

    /// Source a known address was first discovered through.
    pub fn source_of(&self, address: SocketAddr) -> Option<PeerSource> {
        self.candidates.get(&address).map(|c| c.source)
    }

    /// Total known addresses.
    pub fn known(&self) -> usize {
        self.candidates.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("10.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_deduplicates_across_sources() {
        let mut pool = CandidatePool::new(false);

        assert_eq!(pool.add_candidates(PeerSource::Tracker, [addr(1), addr(2)]), 2);
        assert_eq!(pool.add_candidates(PeerSource::Dht, [addr(2), addr(3)]), 1);

        assert_eq!(pool.known(), 3);
        // The duplicate kept its original source
        assert_eq!(pool.source_of(addr(2)), Some(PeerSource::Tracker));
    }

    #[test]
    fn test_private_torrent_rejects_side_channels() {
        let mut pool = CandidatePool::new(true);

        assert_eq!(pool.add_candidates(PeerSource::Dht, [addr(1)]), 0);
        assert_eq!(pool.add_candidates(PeerSource::Pex, [addr(2)]), 0);
        assert_eq!(pool.add_candidates(PeerSource::Lpd, [addr(3)]), 0);
        assert_eq!(pool.add_candidates(PeerSource::Tracker, [addr(4)]), 1);
        assert_eq!(pool.add_candidates(PeerSource::Incoming, [addr(5)]), 1);

        assert_eq!(pool.known(), 2);
    }

    #[test]
    fn test_take_respects_slot_budget() {
        let mut pool = CandidatePool::new(false);
        pool.add_candidates(PeerSource::Tracker, (1..=10).map(addr));

        assert_eq!(pool.take_candidates(3).len(), 3);
        assert_eq!(pool.take_candidates(0).len(), 0);
    }

    #[test]
    fn test_ranking_prefers_tracker_over_dht() {
        let mut pool = CandidatePool::new(false);
        pool.add_candidates(PeerSource::Dht, [addr(1)]);
        pool.add_candidates(PeerSource::Tracker, [addr(2)]);

        let picked = pool.take_candidates(1);
        assert_eq!(picked, vec![addr(2)]);
    }

    #[test]
    fn test_connected_addresses_not_resurfaced() {
        let mut pool = CandidatePool::new(false);
        pool.add_candidates(PeerSource::Tracker, [addr(1)]);

        let picked = pool.take_candidates(5);
        assert_eq!(picked, vec![addr(1)]);
        pool.mark_connected(addr(1));

        assert!(pool.take_candidates(5).is_empty());

        // After disconnect the address may be rediscovered and retried
        pool.mark_disconnected(addr(1));
        assert_eq!(pool.take_candidates(5), vec![addr(1)]);
    }

    #[test]
    fn test_repeated_failures_retire_address() {
        let mut pool = CandidatePool::new(false);
        pool.add_candidates(PeerSource::Tracker, [addr(1)]);

        for _ in 0..3 {
            let picked = pool.take_candidates(1);
            assert_eq!(picked.len(), 1);
            pool.mark_failed(addr(1));
        }

        assert!(pool.take_candidates(1).is_empty());
    }
}
