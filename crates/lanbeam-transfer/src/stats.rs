/// Throughput tracking for the file currently on the wire.
///
/// Pure bookkeeping: the engines feed it byte counts per chunk and forward whatever
/// samples it produces. It knows nothing about sockets or channels.

use std::time::{Duration, Instant};

/// One rate/progress reading for the current file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThroughputSample {
    /// Bytes of the current file moved so far.
    pub bytes: u64,
    /// `bytes / size`, 1.0 for empty files.
    pub fraction: f64,
    /// Bytes per second since the file started.
    pub bytes_per_second: f64,
}

pub struct ThroughputTracker {
    interval: Duration,
    file_size: u64,
    file_bytes: u64,
    started: Instant,
    last_emit: Option<Instant>,
}

impl ThroughputTracker {
    pub fn new(interval: Duration) -> Self {
        ThroughputTracker {
            interval,
            file_size: 0,
            file_bytes: 0,
            started: Instant::now(),
            last_emit: None,
        }
    }

    /// Reset counters and timer for the next file.
    pub fn start_file(&mut self, size: u64) {
        self.start_file_at(size, Instant::now());
    }

    pub fn start_file_at(&mut self, size: u64, now: Instant) {
        self.file_size = size;
        self.file_bytes = 0;
        self.started = now;
        self.last_emit = Some(now);
    }

    /// Account for a chunk. Returns a sample only when the emit interval has passed.
    pub fn record(&mut self, bytes: u64) -> Option<ThroughputSample> {
        self.record_at(bytes, Instant::now())
    }

    pub fn record_at(&mut self, bytes: u64, now: Instant) -> Option<ThroughputSample> {
        self.file_bytes = self.file_bytes.saturating_add(bytes).min(self.file_size);
        let due = match self.last_emit {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        };
        if !due {
            return None;
        }
        self.last_emit = Some(now);
        Some(self.sample_at(now))
    }

    /// Closing sample for the current file, emitted regardless of the interval.
    pub fn finish_file(&mut self) -> ThroughputSample {
        self.finish_file_at(Instant::now())
    }

    pub fn finish_file_at(&mut self, now: Instant) -> ThroughputSample {
        self.file_bytes = self.file_size;
        self.last_emit = Some(now);
        self.sample_at(now)
    }

    pub fn file_bytes(&self) -> u64 {
        self.file_bytes
    }

    fn sample_at(&self, now: Instant) -> ThroughputSample {
        let fraction = if self.file_size == 0 {
            1.0
        } else {
            (self.file_bytes as f64 / self.file_size as f64).min(1.0)
        };
        let secs = now.saturating_duration_since(self.started).as_secs_f64();
        let bytes_per_second = if secs > 0.0 {
            self.file_bytes as f64 / secs
        } else {
            0.0
        };
        ThroughputSample {
            bytes: self.file_bytes,
            fraction,
            bytes_per_second,
        }
    }
}

/// Human-readable rate, e.g. `12.3 MB/s`.
pub fn format_rate(bytes_per_second: f64) -> String {
    const UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];
    let mut value = bytes_per_second.max(0.0);
    let mut unit = 0;
    while value >= 1000.0 && unit < UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(300);

    #[test]
    fn emits_at_most_once_per_interval() {
        let t0 = Instant::now();
        let mut tracker = ThroughputTracker::new(TICK);
        tracker.start_file_at(1000, t0);

        assert!(tracker.record_at(100, t0 + Duration::from_millis(10)).is_none());
        assert!(tracker.record_at(100, t0 + Duration::from_millis(299)).is_none());

        let s = tracker.record_at(100, t0 + Duration::from_millis(300)).unwrap();
        assert_eq!(s.bytes, 300);
        assert!((s.fraction - 0.3).abs() < 1e-9);
        assert!((s.bytes_per_second - 1000.0).abs() < 1e-6);

        assert!(tracker.record_at(100, t0 + Duration::from_millis(400)).is_none());
        assert!(tracker.record_at(100, t0 + Duration::from_millis(600)).is_some());
    }

    #[test]
    fn fractions_are_monotonic_and_end_at_one() {
        let t0 = Instant::now();
        let mut tracker = ThroughputTracker::new(Duration::ZERO);
        tracker.start_file_at(10_000, t0);

        let mut last = 0.0;
        for i in 1..=13u64 {
            let s = tracker.record_at(997, t0 + Duration::from_millis(i)).unwrap();
            assert!(s.fraction >= last);
            assert!(s.fraction <= 1.0);
            last = s.fraction;
        }
        let end = tracker.finish_file_at(t0 + Duration::from_millis(20));
        assert_eq!(end.fraction, 1.0);
        assert_eq!(end.bytes, 10_000);
    }

    #[test]
    fn empty_file_is_complete() {
        let mut tracker = ThroughputTracker::new(TICK);
        tracker.start_file(0);
        assert_eq!(tracker.finish_file().fraction, 1.0);
    }

    #[test]
    fn counters_reset_between_files() {
        let t0 = Instant::now();
        let mut tracker = ThroughputTracker::new(Duration::ZERO);
        tracker.start_file_at(10, t0);
        tracker.record_at(10, t0 + Duration::from_millis(1));
        tracker.start_file_at(100, t0 + Duration::from_millis(2));
        assert_eq!(tracker.file_bytes(), 0);
        let s = tracker.record_at(50, t0 + Duration::from_millis(3)).unwrap();
        assert!((s.fraction - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rate_formatting() {
        assert_eq!(format_rate(512.0), "512 B/s");
        assert_eq!(format_rate(1_500.0), "1.5 KB/s");
        assert_eq!(format_rate(12_300_000.0), "12.3 MB/s");
        assert_eq!(format_rate(2.5e12), "2500.0 GB/s");
    }
}
