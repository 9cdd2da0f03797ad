use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Byte rate over a sliding time window.
#[derive(Debug, Clone)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.total = self.total.saturating_add(bytes);
        self.samples.push_back((now, bytes));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) <= self.window {
                break;
            }
            self.samples.pop_front();
        }
    }

    /// Bytes per second over the window ending now.
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    fn rate_at(&self, now: Instant) -> f64 {
        let in_window: u64 = self
            .samples
            .iter()
            .filter(|(at, _)| now.duration_since(*at) <= self.window)
            .map(|(_, bytes)| bytes)
            .sum();
        in_window as f64 / self.window.as_secs_f64()
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_covers_only_the_window() {
        let start = Instant::now();
        let mut meter = SpeedMeter::new(Duration::from_secs(2));
        meter.record_at(start, 1000);
        meter.record_at(start + Duration::from_secs(1), 1000);
        assert_eq!(meter.rate_at(start + Duration::from_secs(1)), 1000.0);

        meter.record_at(start + Duration::from_secs(4), 500);
        assert_eq!(meter.rate_at(start + Duration::from_secs(4)), 250.0);
        assert_eq!(meter.total(), 2500);
        assert_eq!(meter.samples.len(), 1);
    }
}
