//! Running averages that give more weight to recent samples.

use std::time::Duration;

/// A sliding average with approximately the given inertia: after `inertia`
/// samples the window is "full" and each new sample replaces an average
/// sample's worth of weight.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SlidingAvg {
    mean: f64,
    sample_count: u32,
    inertia: u32,
}

impl SlidingAvg {
    pub fn new(inertia: u32) -> Self {
        debug_assert!(inertia > 0);
        Self {
            mean: 0.0,
            sample_count: 0,
            inertia,
        }
    }

    pub fn update(&mut self, sample: u64) {
        if self.sample_count < self.inertia {
            self.sample_count += 1;
        }
        self.mean += (sample as f64 - self.mean) / self.sample_count as f64;
    }

    pub fn mean(&self) -> u64 {
        self.mean.round() as u64
    }
}

impl Default for SlidingAvg {
    fn default() -> Self {
        // 20 samples is what we generally want for per-second rate averages:
        // long enough to smooth bursts, short enough to follow trends
        Self::new(20)
    }
}

/// A sliding average of durations, used for request round-trip times.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct SlidingDurationAvg(SlidingAvg);

impl SlidingDurationAvg {
    pub fn update(&mut self, sample: Duration) {
        self.0.update(sample.as_millis() as u64);
    }

    pub fn mean(&self) -> Duration {
        Duration::from_millis(self.0.mean())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_is_mean() {
        let mut avg = SlidingAvg::new(4);
        avg.update(100);
        assert_eq!(avg.mean(), 100);
    }

    #[test]
    fn test_mean_converges_to_stable_rate() {
        let mut avg = SlidingAvg::new(4);
        for _ in 0..32 {
            avg.update(1000);
        }
        assert_eq!(avg.mean(), 1000);
    }

    #[test]
    fn test_recent_samples_dominate() {
        let mut avg = SlidingAvg::new(4);
        for _ in 0..8 {
            avg.update(0);
        }
        for _ in 0..8 {
            avg.update(1000);
        }
        // after two windows worth of high samples the old zeros barely matter
        assert!(avg.mean() > 850, "mean: {}", avg.mean());
    }

    #[test]
    fn test_duration_avg() {
        let mut avg = SlidingDurationAvg::default();
        avg.update(Duration::from_millis(50));
        avg.update(Duration::from_millis(150));
        let mean = avg.mean();
        assert!(mean >= Duration::from_millis(50));
        assert!(mean <= Duration::from_millis(150));
    }
}
