//! Rolling transfer rates over a sliding time window.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Span of traffic a rate is averaged over.
pub const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Samples closer together than this share one bucket.
const BUCKET: Duration = Duration::from_millis(100);

/// Byte counter that also reports a rolling bytes-per-second rate.
///
/// Traffic older than the window no longer counts toward the rate, so an
/// idle connection decays to zero instead of keeping its lifetime average.
#[derive(Debug)]
pub struct RateMeter {
    window: Duration,
    total: AtomicU64,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateMeter {
    pub fn new() -> Self {
        Self::with_window(RATE_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            total: AtomicU64::new(0),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    pub fn record_at(&self, bytes: u64, now: Instant) {
        if bytes == 0 {
            return;
        }
        self.total.fetch_add(bytes, Ordering::Relaxed);

        let mut samples = self.samples.lock();
        match samples.back_mut() {
            Some((at, count)) if now.saturating_duration_since(*at) < BUCKET => *count += bytes,
            _ => samples.push_back((now, bytes)),
        }
        self.prune(&mut samples, now);
    }

    /// Bytes recorded since creation.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Bytes per second over the last window.
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&self, now: Instant) -> f64 {
        let mut samples = self.samples.lock();
        self.prune(&mut samples, now);
        let bytes: u64 = samples.iter().map(|(_, count)| count).sum();
        bytes as f64 / self.window.as_secs_f64()
    }

    fn prune(&self, samples: &mut VecDeque<(Instant, u64)>, now: Instant) {
        while let Some((at, _)) = samples.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            samples.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_averages_over_window() {
        let meter = RateMeter::with_window(Duration::from_secs(4));
        let start = Instant::now();

        meter.record_at(1000, start);
        meter.record_at(3000, start + Duration::from_secs(1));

        assert_eq!(meter.rate_at(start + Duration::from_secs(2)), 1000.0);
        assert_eq!(meter.total(), 4000);
    }

    #[test]
    fn test_old_traffic_decays_out_of_rate() {
        let meter = RateMeter::with_window(Duration::from_secs(2));
        let start = Instant::now();

        meter.record_at(4000, start);
        meter.record_at(2000, start + Duration::from_millis(1500));

        assert_eq!(meter.rate_at(start + Duration::from_millis(1900)), 3000.0);
        assert_eq!(meter.rate_at(start + Duration::from_millis(2500)), 1000.0);
        assert_eq!(meter.rate_at(start + Duration::from_secs(10)), 0.0);
        assert_eq!(meter.total(), 6000);
    }

    #[test]
    fn test_close_samples_share_a_bucket() {
        let meter = RateMeter::new();
        let start = Instant::now();
        for i in 0..50 {
            meter.record_at(10, start + Duration::from_millis(i));
        }

        assert_eq!(meter.samples.lock().len(), 1);
        assert_eq!(meter.total(), 500);
        assert_eq!(meter.rate_at(start), 500.0 / RATE_WINDOW.as_secs_f64());
    }

    #[test]
    fn test_idle_meter_reports_zero() {
        let meter = RateMeter::new();
        meter.record(0);
        assert_eq!(meter.rate(), 0.0);
        assert_eq!(meter.total(), 0);
    }
}
