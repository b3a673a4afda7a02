//! Throughput throttle owned by one forwarded connection

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Idle slack after which the accounting window restarts
const BURST_RESET: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    start: Instant,
    total_bytes: u64,
    mbps: f64,
}

/// Sleeps callers so that cumulative throughput stays at or under `max_mbps`
///
/// The rate is passed on every call so a live change to the owning key's rate
/// takes effect on the next chunk. Bookkeeping happens under the lock; the
/// sleep does not.
#[derive(Debug)]
pub struct RateLimiter {
    window: Mutex<Window>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            window: Mutex::new(Window {
                start: Instant::now(),
                total_bytes: 0,
                mbps: 0.0,
            }),
        }
    }

    /// How long the caller must wait after transferring `bytes`
    pub fn delay_for(&self, bytes: usize, max_mbps: f64) -> Duration {
        let mut window = match self.window.lock() {
            Ok(window) => window,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();

        if !(max_mbps > 0.0) {
            window.start = now;
            window.total_bytes = 0;
            window.mbps = max_mbps;
            return Duration::ZERO;
        }

        if window.mbps != max_mbps {
            window.start = now;
            window.total_bytes = 0;
            window.mbps = max_mbps;
        }

        window.total_bytes += bytes as u64;
        let expected = expected_duration(window.total_bytes, max_mbps);
        let elapsed = now.duration_since(window.start);

        if elapsed > expected + BURST_RESET {
            // Idle too long: restart the window instead of allowing a burst
            window.start = now;
            window.total_bytes = bytes as u64;
            return expected_duration(window.total_bytes, max_mbps);
        }

        expected.saturating_sub(elapsed)
    }

    /// Account for `bytes` and sleep if ahead of schedule
    pub async fn throttle(&self, bytes: usize, max_mbps: f64) {
        let delay = self.delay_for(bytes, max_mbps);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn expected_duration(total_bytes: u64, mbps: f64) -> Duration {
    let secs = total_bytes as f64 * 8.0 / (mbps * 1_000_000.0);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_sleeps() {
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..100 {
            limiter.throttle(1 << 20, 0.0).await;
            limiter.throttle(1 << 20, -1.0).await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throughput_bounded_by_rate() {
        // 8 Mbps = 1_000_000 bytes per second
        let limiter = RateLimiter::new();
        let start = Instant::now();
        for _ in 0..10 {
            limiter.throttle(200_000, 8.0).await;
        }
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_gap_does_not_bank_credit() {
        let limiter = RateLimiter::new();
        limiter.throttle(1_000_000, 8.0).await;

        tokio::time::sleep(Duration::from_secs(10)).await;

        // After a long idle gap the next chunk is paced from scratch
        let start = Instant::now();
        limiter.throttle(1_000_000, 8.0).await;
        limiter.throttle(1_000_000, 8.0).await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_change_takes_effect_next_chunk() {
        let limiter = RateLimiter::new();
        limiter.throttle(1_000_000, 8.0).await;

        let start = Instant::now();
        limiter.throttle(1_000_000, 16.0).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_millis(600));
    }

    #[test]
    fn test_same_rate_keeps_window() {
        let limiter = RateLimiter::new();
        let first = limiter.delay_for(500_000, 8.0);
        let second = limiter.delay_for(500_000, 8.0);
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_between_two_pumps() {
        let limiter = Arc::new(RateLimiter::new());
        let start = Instant::now();

        let a = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    limiter.throttle(100_000, 8.0).await;
                }
            })
        };
        let b = {
            let limiter = limiter.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    limiter.throttle(100_000, 8.0).await;
                }
            })
        };
        a.await.unwrap();
        b.await.unwrap();

        // 1_000_000 bytes through one window at 1 MB/s
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
