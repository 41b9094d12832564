//! Upload slot allocation.
//!
//! Unchokes interested peers up to the configured slot budget, preferring the
//! peers that give us the most data, and periodically grants one optimistic
//! slot to a choked peer to discover better upload candidates.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::IndexedRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// How often the optimistic slot rotates to a new peer.
const OPTIMISTIC_INTERVAL: Duration = Duration::from_secs(30);

/// One peer's standing for a rechoke round.
#[derive(Debug, Clone)]
pub struct ChokeCandidate {
    pub address: SocketAddr,
    pub interested: bool,
    /// Bytes the peer delivered to us recently; reciprocation metric.
    pub download_rate: u64,
    pub currently_unchoked: bool,
}

/// Instruction produced by a rechoke round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeDecision {
    Unchoke(SocketAddr),
    Choke(SocketAddr),
}

/// Periodic upload-slot allocator for one torrent.
pub struct Choker {
    upload_slots: usize,
    optimistic: Option<SocketAddr>,
    last_rotation: Instant,
    rng: ChaCha8Rng,
}

impl Choker {
    /// Creates a choker with the given regular slot budget.
    pub fn new(upload_slots: usize, seed: u64) -> Self {
        Self {
            upload_slots,
            optimistic: None,
            last_rotation: Instant::now(),
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Address currently holding the optimistic slot, if any.
    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    /// Runs one rechoke round.
    ///
    /// Regular slots go to the interested peers with the highest download
    /// rate. The optimistic slot rotates on its own interval and always goes
    /// to a peer outside the regular set, so slow peers get a chance to prove
    /// themselves. Everyone else currently unchoked is choked.
    pub fn rechoke(&mut self, candidates: &[ChokeCandidate]) -> Vec<ChokeDecision> {
        let mut ranked: Vec<&ChokeCandidate> =
            candidates.iter().filter(|c| c.interested).collect();
        ranked.sort_by(|a, b| b.download_rate.cmp(&a.download_rate));

        let regular: Vec<SocketAddr> = ranked
            .iter()
            .take(self.upload_slots)
            .map(|c| c.address)
            .collect();

        self.rotate_optimistic(&ranked, &regular);

        let mut unchoked: Vec<SocketAddr> = regular;
        if let Some(address) = self.optimistic {
            if !unchoked.contains(&address) {
                unchoked.push(address);
            }
        }

        let mut decisions = Vec::new();
        for candidate in candidates {
            let should_unchoke = unchoked.contains(&candidate.address);
            if should_unchoke && !candidate.currently_unchoked {
                decisions.push(ChokeDecision::Unchoke(candidate.address));
            } else if !should_unchoke && candidate.currently_unchoked {
                decisions.push(ChokeDecision::Choke(candidate.address));
            }
        }
        decisions
    }

    /// Picks a new optimistic peer when the interval has elapsed or the
    /// current holder disappeared or earned a regular slot.
    fn rotate_optimistic(&mut self, ranked: &[&ChokeCandidate], regular: &[SocketAddr]) {
        let holder_valid = self.optimistic.is_some_and(|address| {
            ranked.iter().any(|c| c.address == address) && !regular.contains(&address)
        });

        if holder_valid && self.last_rotation.elapsed() < OPTIMISTIC_INTERVAL {
            return;
        }

        let eligible: Vec<SocketAddr> = ranked
            .iter()
            .map(|c| c.address)
            .filter(|address| !regular.contains(address))
            .collect();

        self.optimistic = eligible.choose(&mut self.rng).copied();
        self.last_rotation = Instant::now();
    }
}
