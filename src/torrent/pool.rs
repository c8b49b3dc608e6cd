//! The candidate pool: every peer endpoint discovery has produced for a
//! torrent, deduplicated and scored.
//!
//! Trackers, the DHT, and pex all feed this pool; the torrent drains it to
//! fill its connection slots. Candidates that recently failed sit out a
//! cooldown with exponential backoff, and candidates that held a successful
//! connection before are preferred.

use std::{
    collections::HashMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// The base cooldown after a failed connection attempt; doubles per failure.
const FAIL_COOLDOWN: Duration = Duration::from_secs(30);
/// The longest failure cooldown.
const MAX_COOLDOWN: Duration = Duration::from_secs(30 * 60);
/// How long a taken candidate is reserved while its connection attempt is in
/// flight.
const ATTEMPT_RESERVATION: Duration = Duration::from_secs(60);
/// A clean disconnect makes the candidate eligible again after this long.
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct Candidate {
    last_seen: Instant,
    failed_attempts: u32,
    cooldown_until: Option<Instant>,
    /// Whether a connection to this endpoint ever fully established.
    connected_before: bool,
}

/// A bounded, deduplicated pool of candidate peer endpoints.
#[derive(Debug)]
pub(crate) struct CandidatePool {
    entries: HashMap<SocketAddr, Candidate>,
    capacity: usize,
}

impl CandidatePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Registers an endpoint (again). Re-discovery refreshes the recency
    /// score.
    pub fn insert(&mut self, addr: SocketAddr) {
        let now = Instant::now();
        if let Some(candidate) = self.entries.get_mut(&addr) {
            candidate.last_seen = now;
            return;
        }
        if self.entries.len() >= self.capacity {
            // evict the stalest never-connected candidate; if all connected
            // before, the stalest overall
            let evict = self
                .entries
                .iter()
                .filter(|(_, c)| !c.connected_before)
                .min_by_key(|(_, c)| c.last_seen)
                .or_else(|| {
                    self.entries.iter().min_by_key(|(_, c)| c.last_seen)
                })
                .map(|(addr, _)| *addr);
            match evict {
                Some(addr) => {
                    self.entries.remove(&addr);
                }
                None => return,
            }
        }
        self.entries.insert(
            addr,
            Candidate {
                last_seen: now,
                failed_attempts: 0,
                cooldown_until: None,
                connected_before: false,
            },
        );
    }

    pub fn insert_all(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) {
        for addr in addrs {
            self.insert(addr);
        }
    }

    /// Drops an endpoint, e.g. when pex reports it left the swarm.
    pub fn remove(&mut self, addr: &SocketAddr) {
        self.entries.remove(addr);
    }

    /// Takes up to `count` candidates to dial, best scored first. Taken
    /// candidates are reserved for a while so parallel ticks don't dial the
    /// same endpoint twice.
    pub fn take(&mut self, count: usize) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut eligible: Vec<(&SocketAddr, &Candidate)> = self
            .entries
            .iter()
            .filter(|(_, c)| {
                c.cooldown_until.map(|until| until <= now).unwrap_or(true)
            })
            .collect();
        // previously successful endpoints first, then the most recently seen
        eligible.sort_by_key(|(_, c)| {
            (std::cmp::Reverse(c.connected_before), now - c.last_seen)
        });
        let taken: Vec<SocketAddr> = eligible
            .into_iter()
            .take(count)
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &taken {
            if let Some(candidate) = self.entries.get_mut(addr) {
                candidate.cooldown_until = Some(now + ATTEMPT_RESERVATION);
            }
        }
        taken
    }

    /// Records a fully established connection to the endpoint.
    pub fn on_connected(&mut self, addr: &SocketAddr) {
        if let Some(candidate) = self.entries.get_mut(addr) {
            candidate.connected_before = true;
            candidate.failed_attempts = 0;
        }
    }

    /// Records a failed connection attempt, backing the endpoint off
    /// exponentially.
    pub fn on_failure(&mut self, addr: &SocketAddr) {
        if let Some(candidate) = self.entries.get_mut(addr) {
            candidate.failed_attempts += 1;
            let cooldown = FAIL_COOLDOWN
                .checked_mul(
                    1u32.checked_shl(candidate.failed_attempts - 1)
                        .unwrap_or(u32::MAX),
                )
                .unwrap_or(MAX_COOLDOWN)
                .min(MAX_COOLDOWN);
            candidate.cooldown_until = Some(Instant::now() + cooldown);
        }
    }

    /// Records a clean disconnect; the endpoint may be re-dialed after a
    /// short cooldown.
    pub fn on_disconnected(&mut self, addr: &SocketAddr) {
        if let Some(candidate) = self.entries.get_mut(addr) {
            candidate.cooldown_until =
                Some(Instant::now() + RECONNECT_COOLDOWN);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(host: u8, port: u16) -> SocketAddr {
        ([10, 0, 0, host], port).into()
    }

    #[test]
    fn test_insert_dedups() {
        let mut pool = CandidatePool::new(10);
        pool.insert(addr(1, 6881));
        pool.insert(addr(1, 6881));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_take_prefers_known_good_peers() {
        let mut pool = CandidatePool::new(10);
        pool.insert(addr(1, 1));
        pool.insert(addr(2, 2));
        pool.insert(addr(3, 3));
        pool.on_connected(&addr(2, 2));

        let taken = pool.take(1);
        assert_eq!(taken, vec![addr(2, 2)]);
    }

    #[test]
    fn test_taken_candidates_are_reserved() {
        let mut pool = CandidatePool::new(10);
        pool.insert(addr(1, 1));
        assert_eq!(pool.take(5), vec![addr(1, 1)]);
        // a second drain inside the reservation window finds nothing
        assert!(pool.take(5).is_empty());
    }

    #[test]
    fn test_failure_applies_cooldown() {
        let mut pool = CandidatePool::new(10);
        pool.insert(addr(1, 1));
        pool.on_failure(&addr(1, 1));
        assert!(pool.take(5).is_empty());
    }

    #[test]
    fn test_capacity_evicts_stale_unknowns() {
        let mut pool = CandidatePool::new(2);
        pool.insert(addr(1, 1));
        pool.insert(addr(2, 2));
        pool.on_connected(&addr(1, 1));
        // over capacity: the never-connected candidate 2 is evicted, not
        // the proven candidate 1
        pool.insert(addr(3, 3));
        assert_eq!(pool.len(), 2);
        let mut remaining: Vec<SocketAddr> =
            pool.entries.keys().copied().collect();
        remaining.sort();
        assert!(remaining.contains(&addr(1, 1)));
        assert!(remaining.contains(&addr(3, 3)));
    }
}
