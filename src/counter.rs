//! Byte counters for the various channels of a connection or torrent.
//!
//! A counter is advanced by the owner as bytes flow and "ticked" once a
//! second, which closes the current round and folds it into the rate average.

use crate::avg::SlidingAvg;

/// Counts the bytes that flow through a single channel and keeps a per-second
/// rate estimate.
#[derive(Clone, Debug, Default)]
pub(crate) struct Counter {
    total: u64,
    round: u64,
    peak: u64,
    rate: SlidingAvg,
}

impl Counter {
    /// Records that `bytes` were transferred this round.
    pub fn add(&mut self, bytes: u64) {
        self.round += bytes;
    }

    /// Closes the current round. Must be called once a second for the rate
    /// average to mean anything.
    pub fn tick(&mut self) {
        self.total += self.round;
        self.rate.update(self.round);
        let rate = self.rate.mean();
        if rate > self.peak {
            self.peak = rate;
        }
        self.round = 0;
    }

    /// All bytes recorded in closed rounds.
    pub fn total(&self) -> u64 {
        self.total + self.round
    }

    /// The smoothed per-second rate.
    pub fn avg_rate(&self) -> u64 {
        self.rate.mean()
    }

    pub fn peak_rate(&self) -> u64 {
        self.peak
    }
}

/// Counters of a single direction of a connection, split by whether the bytes
/// carried payload (block data) or protocol chatter.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChannelCounter {
    pub payload: Counter,
    pub protocol: Counter,
}

impl ChannelCounter {
    pub fn tick(&mut self) {
        self.payload.tick();
        self.protocol.tick();
    }

    pub fn total(&self) -> u64 {
        self.payload.total() + self.protocol.total()
    }
}

/// The throughput counters of a peer session or a whole torrent.
#[derive(Clone, Debug, Default)]
pub(crate) struct ThruputCounters {
    pub down: ChannelCounter,
    pub up: ChannelCounter,
    /// Bytes received that had to be discarded: duplicate or unexpected
    /// blocks.
    pub waste: Counter,
}

impl ThruputCounters {
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
        self.waste.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_accumulates_into_total() {
        let mut counter = Counter::default();
        counter.add(500);
        assert_eq!(counter.total(), 500);
        counter.tick();
        counter.add(200);
        assert_eq!(counter.total(), 700);
    }

    #[test]
    fn test_rate_follows_stable_thruput() {
        let mut counter = Counter::default();
        for _ in 0..30 {
            counter.add(1000);
            counter.tick();
        }
        assert_eq!(counter.avg_rate(), 1000);
        assert_eq!(counter.peak_rate(), 1000);
    }

    #[test]
    fn test_peak_is_retained_after_slowdown() {
        let mut counter = Counter::default();
        for _ in 0..30 {
            counter.add(10_000);
            counter.tick();
        }
        for _ in 0..60 {
            counter.tick();
        }
        assert!(counter.avg_rate() < 1000);
        assert_eq!(counter.peak_rate(), 10_000);
    }
}
