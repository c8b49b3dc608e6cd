//! The choking algorithm: which interested peers get our upload slots.
//!
//! Every ten seconds the torrent recomputes the unchoke set: the best
//! transfer partners by recent rate keep their slots, plus one "optimistic"
//! slot rotated among the rest every thirty seconds so unproven peers get a
//! chance to show what they can do. Snubbed peers are demoted, and if every
//! unchoked peer is snubbing us, extra optimistic slots probe for better
//! company.

use std::{collections::HashSet, net::SocketAddr};

use rand::seq::SliceRandom;

/// The optimistic slot rotates every this many choke rounds (rounds run
/// every 10 seconds, so this is the conventional 30 seconds).
const OPTIMISTIC_ROTATION_ROUNDS: u64 = 3;

/// A peer as the choker sees it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChokeCandidate {
    pub addr: SocketAddr,
    /// The peer's recent transfer rate: its download rate to us while we
    /// leech, its upload rate from us while we seed.
    pub rate: u64,
    /// Only interested peers compete for slots.
    pub is_interested: bool,
    /// An unchoked peer that sent nothing for too long.
    pub is_snubbed: bool,
}

/// The slot changes of one choke round.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ChokeDecisions {
    pub unchoke: Vec<SocketAddr>,
    pub choke: Vec<SocketAddr>,
}

pub(crate) struct Choker {
    upload_slots: usize,
    optimistic: Option<SocketAddr>,
    round: u64,
}

impl Choker {
    pub fn new(upload_slots: usize) -> Self {
        Self {
            upload_slots: upload_slots.max(1),
            optimistic: None,
            round: 0,
        }
    }

    /// Runs one choke round and returns the slot changes relative to the
    /// currently unchoked set.
    pub fn run(
        &mut self,
        candidates: &[ChokeCandidate],
        currently_unchoked: &HashSet<SocketAddr>,
    ) -> ChokeDecisions {
        self.round += 1;

        // the regular slots go to the fastest interested peers that aren't
        // snubbing us
        let mut ranked: Vec<&ChokeCandidate> = candidates
            .iter()
            .filter(|c| c.is_interested && !c.is_snubbed)
            .collect();
        ranked.sort_by_key(|c| std::cmp::Reverse(c.rate));

        let regular_slots = self.upload_slots.saturating_sub(1);
        let mut unchoked: HashSet<SocketAddr> =
            ranked.iter().take(regular_slots).map(|c| c.addr).collect();

        // rotate the optimistic slot among the interested rest
        let rotate = self.round % OPTIMISTIC_ROTATION_ROUNDS == 1
            || self
                .optimistic
                .map(|addr| {
                    !candidates
                        .iter()
                        .any(|c| c.addr == addr && c.is_interested)
                })
                .unwrap_or(true);
        if rotate {
            let outsiders: Vec<SocketAddr> = candidates
                .iter()
                .filter(|c| {
                    c.is_interested
                        && !c.is_snubbed
                        && !unchoked.contains(&c.addr)
                })
                .map(|c| c.addr)
                .collect();
            self.optimistic =
                outsiders.choose(&mut rand::thread_rng()).copied();
        }
        if let Some(optimistic) = self.optimistic {
            unchoked.insert(optimistic);
        }

        // anti-snub: when everyone we unchoked is stalling, open extra
        // optimistic slots to find working peers
        let all_snubbed = !currently_unchoked.is_empty()
            && candidates
                .iter()
                .filter(|c| currently_unchoked.contains(&c.addr))
                .all(|c| c.is_snubbed);
        if all_snubbed {
            let mut extra: Vec<SocketAddr> = candidates
                .iter()
                .filter(|c| {
                    c.is_interested
                        && !c.is_snubbed
                        && !unchoked.contains(&c.addr)
                })
                .map(|c| c.addr)
                .collect();
            extra.shuffle(&mut rand::thread_rng());
            for addr in extra.into_iter().take(self.upload_slots) {
                unchoked.insert(addr);
            }
        }

        ChokeDecisions {
            unchoke: unchoked
                .iter()
                .filter(|addr| !currently_unchoked.contains(addr))
                .copied()
                .collect(),
            choke: currently_unchoked
                .iter()
                .filter(|addr| !unchoked.contains(addr))
                .copied()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn addr(host: u8) -> SocketAddr {
        ([10, 0, 0, host], 6881).into()
    }

    fn candidate(host: u8, rate: u64) -> ChokeCandidate {
        ChokeCandidate {
            addr: addr(host),
            rate,
            is_interested: true,
            is_snubbed: false,
        }
    }

    #[test]
    fn test_fastest_interested_peers_get_slots() {
        let mut choker = Choker::new(3);
        let candidates = vec![
            candidate(1, 100),
            candidate(2, 5000),
            candidate(3, 300),
            candidate(4, 2000),
        ];
        let decisions = choker.run(&candidates, &HashSet::new());

        // 2 regular slots (fastest: peers 2 and 4) plus one optimistic
        assert_eq!(decisions.choke, vec![]);
        assert_eq!(decisions.unchoke.len(), 3);
        assert!(decisions.unchoke.contains(&addr(2)));
        assert!(decisions.unchoke.contains(&addr(4)));
    }

    #[test]
    fn test_uninterested_peers_get_no_slot() {
        let mut choker = Choker::new(4);
        let mut lazy = candidate(1, 9000);
        lazy.is_interested = false;
        let decisions = choker.run(&[lazy], &HashSet::new());
        assert_eq!(decisions, ChokeDecisions::default());
    }

    #[test]
    fn test_demoted_peer_is_choked() {
        let mut choker = Choker::new(2);
        let fast = candidate(1, 1000);
        let faster = candidate(2, 2000);

        let mut unchoked = HashSet::new();
        unchoked.insert(addr(1));
        unchoked.insert(addr(2));

        // only one regular slot: the slower of the two currently unchoked
        // loses it, unless the optimistic slot catches it
        let decisions = choker.run(&[fast, faster], &unchoked);
        for choked in &decisions.choke {
            assert_ne!(*choked, addr(2), "fastest peer must keep its slot");
        }
    }

    #[test]
    fn test_optimistic_slot_is_sticky_between_rotations() {
        let mut choker = Choker::new(1);
        // with a single slot, the only unchoke is the optimistic one
        let candidates = vec![
            candidate(1, 0),
            candidate(2, 0),
            candidate(3, 0),
        ];
        choker.run(&candidates, &HashSet::new());
        let first = choker.optimistic;
        assert!(first.is_some());
        // rounds 2 and 3 keep the same optimistic peer
        choker.run(&candidates, &HashSet::new());
        assert_eq!(choker.optimistic, first);
        choker.run(&candidates, &HashSet::new());
        assert_eq!(choker.optimistic, first);
    }

    #[test]
    fn test_anti_snub_opens_extra_slots() {
        let mut choker = Choker::new(2);
        let mut snubber = candidate(1, 5000);
        snubber.is_snubbed = true;
        let fresh_a = candidate(2, 0);
        let fresh_b = candidate(3, 0);

        let mut unchoked = HashSet::new();
        unchoked.insert(addr(1));

        let decisions =
            choker.run(&[snubber, fresh_a, fresh_b], &unchoked);
        // the snubber loses its slot and both fresh peers are probed
        assert!(decisions.choke.contains(&addr(1)));
        assert!(decisions.unchoke.contains(&addr(2)));
        assert!(decisions.unchoke.contains(&addr(3)));
    }
}
