use std::time::Duration;

use tokio::time::Instant;

/// Default minimum time between progress notifications.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Default progress delta (in percent) that forces a notification.
pub const DEFAULT_PROGRESS_STEP: u8 = 5;

/// A progress notification produced by [`ProgressThrottle::update`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    pub percent: u8,
    /// Bytes per second since the previous tick.
    pub throughput: f64,
}

/// Limits how often progress is published for one transfer.
///
/// A tick is produced when at least `interval` has elapsed since the last
/// one, or when progress advanced by `step` percent or more.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    step: u8,
    last_at: Instant,
    last_percent: u8,
    last_bytes: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, step: u8) -> Self {
        Self {
            interval,
            step,
            last_at: Instant::now(),
            last_percent: 0,
            last_bytes: 0,
        }
    }

    /// Records `done` of `total` bytes and returns a tick if one is due.
    pub fn update(&mut self, done: u64, total: u64) -> Option<ProgressTick> {
        let now = Instant::now();
        let percent = percent_of(done, total);
        let elapsed = now.duration_since(self.last_at);

        let due = elapsed >= self.interval || percent.saturating_sub(self.last_percent) >= self.step;
        if !due {
            return None;
        }

        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            done.saturating_sub(self.last_bytes) as f64 / secs
        } else {
            0.0
        };

        self.last_at = now;
        self.last_percent = percent;
        self.last_bytes = done;
        Some(ProgressTick {
            percent,
            throughput,
        })
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_INTERVAL, DEFAULT_PROGRESS_STEP)
    }
}

/// Integer percentage, treating an empty total as complete.
pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn small_steps_are_suppressed() {
        tokio::time::pause();
        let mut throttle = ProgressThrottle::default();
        assert!(throttle.update(1, 1000).is_none());
        assert!(throttle.update(30, 1000).is_none());
    }

    #[tokio::test]
    async fn step_threshold_forces_tick() {
        tokio::time::pause();
        let mut throttle = ProgressThrottle::default();
        let tick = throttle.update(50, 1000).unwrap();
        assert_eq!(tick.percent, 5);
        assert!(throttle.update(60, 1000).is_none());
    }

    #[tokio::test]
    async fn interval_forces_tick_with_throughput() {
        tokio::time::pause();
        let mut throttle = ProgressThrottle::default();
        tokio::time::advance(Duration::from_millis(500)).await;

        let tick = throttle.update(10, 1000).unwrap();
        assert_eq!(tick.percent, 1);
        assert!((tick.throughput - 20.0).abs() < 1e-6);
    }

    #[test]
    fn percent_handles_edges() {
        assert_eq!(percent_of(0, 0), 100);
        assert_eq!(percent_of(5, 10), 50);
        assert_eq!(percent_of(20, 10), 100);
        assert_eq!(percent_of(u64::MAX, u64::MAX), 100);
    }
}
