//! Transfer rate smoothing and progress throttling.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::core::config::{PROGRESS_THROTTLE, RATE_SAMPLE_WINDOW};

/// Rolling average of the last few instantaneous rate samples (bytes/s).
#[derive(Debug)]
pub struct RateMeter {
    samples: VecDeque<f64>,
    window: usize,
    last: Option<Instant>,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new(RATE_SAMPLE_WINDOW)
    }
}

impl RateMeter {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window: window.max(1),
            last: None,
        }
    }

    /// Record `bytes` arriving at `now`; returns the smoothed rate.
    pub fn record_at(&mut self, bytes: usize, now: Instant) -> f64 {
        if let Some(last) = self.last {
            let secs = now.saturating_duration_since(last).as_secs_f64();
            if secs > 0.0 {
                if self.samples.len() == self.window {
                    self.samples.pop_front();
                }
                self.samples.push_back(bytes as f64 / secs);
            }
        }
        self.last = Some(now);
        self.rate()
    }

    pub fn record(&mut self, bytes: usize) -> f64 {
        self.record_at(bytes, Instant::now())
    }

    pub fn rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }
}

/// Lets progress through at most once per interval.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(PROGRESS_THROTTLE)
    }
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// `force` bypasses the throttle (used for the final chunk).
    pub fn ready_at(&mut self, now: Instant, force: bool) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        };
        if due || force {
            self.last = Some(now);
            return true;
        }
        false
    }

    pub fn ready(&mut self, force: bool) -> bool {
        self.ready_at(Instant::now(), force)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_averages_last_samples() {
        let mut meter = RateMeter::new(2);
        let t0 = Instant::now();
        assert_eq!(meter.record_at(100, t0), 0.0);
        meter.record_at(100, t0 + Duration::from_secs(1)); // 100 B/s
        meter.record_at(300, t0 + Duration::from_secs(2)); // 300 B/s
        assert_eq!(meter.rate(), 200.0);
        // Window of 2: the 100 B/s sample falls out.
        meter.record_at(500, t0 + Duration::from_secs(3));
        assert_eq!(meter.rate(), 400.0);
    }

    #[test]
    fn test_rate_ignores_zero_interval() {
        let mut meter = RateMeter::default();
        let t0 = Instant::now();
        meter.record_at(10, t0);
        assert_eq!(meter.record_at(10, t0), 0.0);
    }

    #[test]
    fn test_throttle_once_per_interval_unless_forced() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(throttle.ready_at(t0, false));
        assert!(!throttle.ready_at(t0 + Duration::from_millis(500), false));
        assert!(throttle.ready_at(t0 + Duration::from_millis(600), true));
        assert!(!throttle.ready_at(t0 + Duration::from_millis(900), false));
        assert!(throttle.ready_at(t0 + Duration::from_millis(1700), false));
    }
}
