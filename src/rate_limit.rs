//! Token bucket rate limiting for the wire payload channels.
//!
//! The cost of a transfer is paid before the bytes move: a peer session
//! acquires tokens for a block before accepting it into the write pipeline or
//! before queueing a served block on the socket. The bucket capacity is a
//! single block, so a burst can overshoot a configured rate by at most one
//! block.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use crate::BLOCK_LEN;

/// A token bucket replenished at the configured rate.
#[derive(Debug)]
struct TokenBucket {
    /// Bytes per second. `None` means the bucket is disabled and every
    /// acquisition succeeds immediately.
    rate: Option<u64>,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    const CAPACITY: f64 = BLOCK_LEN as f64;

    fn new(rate: Option<u64>) -> Self {
        Self {
            rate,
            tokens: Self::CAPACITY,
            last_refill: Instant::now(),
        }
    }

    /// Tries to take `cost` tokens. On success returns `None`; otherwise the
    /// duration after which enough tokens will have been replenished.
    fn try_acquire(&mut self, cost: u64) -> Option<Duration> {
        let rate = match self.rate {
            Some(rate) => rate,
            None => return None,
        };
        // a cost above the bucket capacity could never be paid
        let cost = (cost as f64).min(Self::CAPACITY);

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = Self::CAPACITY
            .min(self.tokens + elapsed.as_secs_f64() * rate as f64);

        if self.tokens >= cost {
            self.tokens -= cost;
            None
        } else {
            let missing = cost - self.tokens;
            Some(Duration::from_secs_f64(missing / rate as f64))
        }
    }
}

/// The pair of download and upload buckets shared by all sessions of a torrent
/// (or of the whole engine).
#[derive(Debug)]
pub(crate) struct RateLimiter {
    down: Mutex<TokenBucket>,
    up: Mutex<TokenBucket>,
}

impl RateLimiter {
    pub fn new(down_rate: Option<u64>, up_rate: Option<u64>) -> Self {
        Self {
            down: Mutex::new(TokenBucket::new(down_rate)),
            up: Mutex::new(TokenBucket::new(up_rate)),
        }
    }

    pub fn set_rates(&self, down_rate: Option<u64>, up_rate: Option<u64>) {
        self.down.lock().unwrap().rate = down_rate;
        self.up.lock().unwrap().rate = up_rate;
    }

    /// Waits until `cost` bytes worth of download tokens are available.
    pub async fn acquire_down(&self, cost: u64) {
        Self::acquire(&self.down, cost).await;
    }

    /// Waits until `cost` bytes worth of upload tokens are available.
    pub async fn acquire_up(&self, cost: u64) {
        Self::acquire(&self.up, cost).await;
    }

    async fn acquire(bucket: &Mutex<TokenBucket>, cost: u64) {
        loop {
            // the lock is never held across an await point
            let wait = bucket.lock().unwrap().try_acquire(cost);
            match wait {
                None => return,
                Some(wait) => tokio::time::delay_for(wait).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_bucket_never_waits() {
        let mut bucket = TokenBucket::new(None);
        for _ in 0..1000 {
            assert_eq!(bucket.try_acquire(BLOCK_LEN as u64), None);
        }
    }

    #[test]
    fn test_initial_burst_is_one_block() {
        let mut bucket = TokenBucket::new(Some(1024));
        // the first full block is covered by the initial capacity
        assert_eq!(bucket.try_acquire(BLOCK_LEN as u64), None);
        // the second is not, and the wait is proportional to the deficit
        let wait = bucket
            .try_acquire(BLOCK_LEN as u64)
            .expect("second block should not be covered");
        assert!(wait > Duration::from_secs(10));
    }

    #[test]
    fn test_oversized_cost_is_clamped() {
        let mut bucket = TokenBucket::new(Some(1024));
        // a cost above capacity must not dead-lock the acquirer
        assert_eq!(bucket.try_acquire(10 * BLOCK_LEN as u64), None);
    }

    #[test]
    fn test_tokens_replenish() {
        let mut bucket = TokenBucket::new(Some(1_000_000));
        assert_eq!(bucket.try_acquire(BLOCK_LEN as u64), None);
        // drain, then pretend time passed by backdating the refill stamp
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now() - Duration::from_secs(1);
        assert_eq!(bucket.try_acquire(BLOCK_LEN as u64), None);
    }
}
