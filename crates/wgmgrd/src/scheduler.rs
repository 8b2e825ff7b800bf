//! Jittered periodic ticker for synchronization passes.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

/// Fires every `interval` plus a random extra delay in `0..=max_delay`.
///
/// The next deadline is computed from when the previous tick was taken, so a
/// slow pass pushes later ticks back instead of queueing them.
#[derive(Debug)]
pub struct JitterTicker {
    interval: Duration,
    max_delay: Duration,
    next: Instant,
}

impl JitterTicker {
    pub fn new(interval: Duration, max_delay: Duration) -> Self {
        let mut ticker = Self {
            interval,
            max_delay,
            next: Instant::now(),
        };
        ticker.next = Instant::now() + ticker.next_period();
        ticker
    }

    /// Picks the length of the next period.
    pub fn next_period(&self) -> Duration {
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return self.interval;
        }
        let jitter = rand::thread_rng().gen_range(0..=max_ms);
        self.interval + Duration::from_millis(jitter)
    }

    /// Waits for the next deadline. Cancel safe.
    pub async fn tick(&mut self) {
        tokio::time::sleep_until(self.next).await;
        self.next = Instant::now() + self.next_period();
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_next_period_within_bounds() {
        let ticker = JitterTicker::new(Duration::from_secs(60), Duration::from_secs(45));
        for _ in 0..1000 {
            let period = ticker.next_period();
            assert!(period >= Duration::from_secs(60));
            assert!(period <= Duration::from_secs(105));
        }
    }

    #[test]
    fn test_zero_delay_is_exact() {
        let ticker = JitterTicker::new(Duration::from_secs(30), Duration::ZERO);
        assert_eq!(ticker.next_period(), Duration::from_secs(30));
        assert_eq!(ticker.max_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_tick_waits_for_interval() {
        let mut ticker = JitterTicker::new(Duration::from_millis(20), Duration::from_millis(5));
        let start = std::time::Instant::now();
        ticker.tick().await;
        ticker.tick().await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
