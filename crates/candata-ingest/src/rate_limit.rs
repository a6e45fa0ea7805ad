//! Dual-window admission gate for quota-limited APIs
//!
//! A [`RateLimiter`] enforces a per-second and a per-hour call ceiling at the
//! same time. Each window is a FIFO queue of admission instants; on every
//! [`RateLimiter::acquire`] the queues are pruned, and if either is full the
//! caller sleeps exactly until the oldest entry of the binding queue leaves
//! its window (plus a small safety margin) before checking again.
//!
//! One limiter is meant to be shared per external API through an `Arc`.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

const SECOND_WINDOW: Duration = Duration::from_secs(1);
const HOUR_WINDOW: Duration = Duration::from_secs(3600);

/// Default slack added to every computed wait
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct RateWindows {
    second: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    total_calls: u64,
}

/// Which window forced a caller to wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Second,
    Hour,
}

impl RateWindows {
    fn prune(&mut self, now: Instant) {
        prune_window(&mut self.second, now, SECOND_WINDOW);
        prune_window(&mut self.hour, now, HOUR_WINDOW);
    }

    /// Time until a slot frees up, or `None` if one is free now
    fn wait_needed(&self, now: Instant, per_second: usize, per_hour: usize) -> Option<(Duration, Binding)> {
        let second = full_window_wait(&self.second, now, per_second, SECOND_WINDOW);
        let hour = full_window_wait(&self.hour, now, per_hour, HOUR_WINDOW);

        match (second, hour) {
            (None, None) => None,
            (Some(s), None) => Some((s, Binding::Second)),
            (None, Some(h)) => Some((h, Binding::Hour)),
            (Some(s), Some(h)) if h >= s => Some((h, Binding::Hour)),
            (Some(s), Some(_)) => Some((s, Binding::Second)),
        }
    }

    fn admit(&mut self, now: Instant) {
        self.second.push_back(now);
        self.hour.push_back(now);
        self.total_calls += 1;
    }
}

fn prune_window(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while queue
        .front()
        .is_some_and(|oldest| now.duration_since(*oldest) >= window)
    {
        queue.pop_front();
    }
}

fn full_window_wait(
    queue: &VecDeque<Instant>,
    now: Instant,
    capacity: usize,
    window: Duration,
) -> Option<Duration> {
    if queue.len() < capacity {
        return None;
    }
    let oldest = queue.front()?;
    Some(window.saturating_sub(now.duration_since(*oldest)))
}

/// Per-second plus per-hour call limiter
#[derive(Debug)]
pub struct RateLimiter {
    per_second: usize,
    per_hour: usize,
    safety_margin: Duration,
    windows: Mutex<RateWindows>,
}

impl RateLimiter {
    /// Ceilings are fixed for the limiter's lifetime; zero is raised to one
    pub fn new(per_second: u32, per_hour: u32) -> Self {
        Self::with_safety_margin(per_second, per_hour, DEFAULT_SAFETY_MARGIN)
    }

    pub fn with_safety_margin(per_second: u32, per_hour: u32, safety_margin: Duration) -> Self {
        Self {
            per_second: per_second.max(1) as usize,
            per_hour: per_hour.max(1) as usize,
            safety_margin,
            windows: Mutex::new(RateWindows::default()),
        }
    }

    pub fn per_second(&self) -> u32 {
        self.per_second as u32
    }

    pub fn per_hour(&self) -> u32 {
        self.per_hour as u32
    }

    /// Wait for a free slot in both windows, then record the call
    ///
    /// The lock is not held while sleeping, so concurrent callers recheck
    /// independently; admission order is not FIFO but both ceilings hold in
    /// aggregate.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut windows = self.windows.lock().await;
                let now = Instant::now();
                windows.prune(now);

                match windows.wait_needed(now, self.per_second, self.per_hour) {
                    None => {
                        windows.admit(now);
                        return;
                    },
                    Some((wait, binding)) => {
                        let wait = wait + self.safety_margin;
                        match binding {
                            Binding::Second => debug!(
                                wait_ms = wait.as_millis() as u64,
                                "rate limit: per-second window full"
                            ),
                            Binding::Hour => warn!(
                                wait_s = wait.as_secs_f64(),
                                calls_this_hour = windows.hour.len(),
                                "rate limit: hourly quota reached"
                            ),
                        }
                        wait
                    },
                }
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Calls admitted so far
    pub async fn total_calls(&self) -> u64 {
        self.windows.lock().await.total_calls
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Largest number of instants inside any half-open window of `width`
    fn max_in_window(stamps: &[Instant], width: Duration) -> usize {
        let mut sorted = stamps.to_vec();
        sorted.sort();
        let mut best = 0;
        let mut start = 0;
        for end in 0..sorted.len() {
            while sorted[end].duration_since(sorted[start]) >= width {
                start += 1;
            }
            best = best.max(end - start + 1);
        }
        best
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_up_to_per_second_is_immediate() {
        let limiter = RateLimiter::new(5, 100);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert_eq!(Instant::now(), start);
        assert_eq!(limiter.total_calls().await, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_exactly_for_oldest_to_expire() {
        let limiter = RateLimiter::with_safety_margin(2, 100, Duration::from_millis(50));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(Instant::now() - start, Duration::from_millis(1050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_calls_respect_both_ceilings() {
        let limiter = RateLimiter::new(3, 20);
        let mut stamps = Vec::new();
        for _ in 0..45 {
            limiter.acquire().await;
            stamps.push(Instant::now());
        }

        assert!(max_in_window(&stamps, SECOND_WINDOW) <= 3);
        assert!(max_in_window(&stamps, HOUR_WINDOW) <= 20);
        // The 21st call has to wait for the first to leave the hour window
        assert!(stamps[20].duration_since(stamps[0]) >= HOUR_WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_ceilings() {
        let limiter = Arc::new(RateLimiter::new(2, 10));
        let stamps = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let stamps = stamps.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..4 {
                    limiter.acquire().await;
                    stamps.lock().await.push(Instant::now());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stamps = stamps.lock().await;
        assert_eq!(stamps.len(), 16);
        assert!(max_in_window(&stamps, SECOND_WINDOW) <= 2);
        assert!(max_in_window(&stamps, HOUR_WINDOW) <= 10);
        assert_eq!(limiter.total_calls().await, 16);
    }

    #[test]
    fn test_zero_ceilings_are_raised() {
        let limiter = RateLimiter::new(0, 0);
        assert_eq!(limiter.per_second(), 1);
        assert_eq!(limiter.per_hour(), 1);
    }
}
