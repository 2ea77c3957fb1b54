//! Traffic statistics
//!
//! Thread-safe counters updated by the traffic worker on every iteration and
//! read by the UI on every tick. Counters are plain atomics; the rolling
//! latency and throughput windows sit behind `RwLock`s.

use std::collections::VecDeque;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on samples kept in a rolling window
const ROLLING_WINDOW_SIZE: usize = 1024;

/// Rolling window length for latency and throughput
pub const ROLLING_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
struct Sample {
    value: u64,
    timestamp: Instant,
}

/// Time-bounded window of samples
#[derive(Debug)]
struct RollingWindow {
    samples: VecDeque<Sample>,
    window_duration: Duration,
}

impl RollingWindow {
    fn new(window_duration: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(ROLLING_WINDOW_SIZE),
            window_duration,
        }
    }

    fn add_sample(&mut self, value: u64) {
        let now = Instant::now();
        if self.samples.len() == ROLLING_WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample {
            value,
            timestamp: now,
        });
        self.prune_old_samples(now);
    }

    fn prune_old_samples(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window_duration) else {
            return;
        };
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn min(&self) -> Option<u64> {
        self.samples.iter().map(|s| s.value).min()
    }

    fn max(&self) -> Option<u64> {
        self.samples.iter().map(|s| s.value).max()
    }

    fn avg(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: u64 = self.samples.iter().map(|s| s.value).sum();
        Some(sum / self.samples.len() as u64)
    }

    /// Sum of values per second across the window
    fn rate_per_second(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }

        let total: u64 = self.samples.iter().map(|s| s.value).sum();
        match (self.samples.front(), self.samples.back()) {
            (Some(first), Some(last)) => {
                let secs = last.timestamp.duration_since(first.timestamp).as_secs_f64();
                if secs > 0.0 { total as f64 / secs } else { 0.0 }
            }
            _ => 0.0,
        }
    }
}

/// Latency statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub min_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
}

impl LatencyStats {
    /// Format the average latency for display
    pub fn format_avg(&self) -> String {
        format!("{:.2} ms", self.avg_us as f64 / 1000.0)
    }
}

/// Counters for one traffic session
#[derive(Debug)]
pub struct TrafficStats {
    /// Successful transfers (read-backs are not counted separately)
    packets: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    /// Failed transfers other than timeouts
    errors: AtomicU64,
    timeouts: AtomicU64,
    latency: RwLock<RollingWindow>,
    throughput: RwLock<RollingWindow>,
    started_at: RwLock<Option<Instant>>,
    stopped_at: RwLock<Option<Instant>>,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficStats {
    pub fn new() -> Self {
        Self {
            packets: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            latency: RwLock::new(RollingWindow::new(ROLLING_WINDOW)),
            throughput: RwLock::new(RollingWindow::new(ROLLING_WINDOW)),
            started_at: RwLock::new(None),
            stopped_at: RwLock::new(None),
        }
    }

    /// Clear all counters and mark the session start
    pub fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);

        if let Ok(mut latency) = self.latency.write() {
            *latency = RollingWindow::new(ROLLING_WINDOW);
        }
        if let Ok(mut throughput) = self.throughput.write() {
            *throughput = RollingWindow::new(ROLLING_WINDOW);
        }
        if let Ok(mut started_at) = self.started_at.write() {
            *started_at = Some(Instant::now());
        }
        if let Ok(mut stopped_at) = self.stopped_at.write() {
            *stopped_at = None;
        }
    }

    /// Mark the session as finished, freezing the elapsed time
    pub fn mark_stopped(&self) {
        if let Ok(mut stopped_at) = self.stopped_at.write() {
            stopped_at.get_or_insert_with(Instant::now);
        }
    }

    /// Length of the current or last session, `None` before the first reset
    pub fn elapsed(&self) -> Option<Duration> {
        let started_at = (*self.started_at.read().ok()?)?;
        let stopped_at = self.stopped_at.read().ok().and_then(|t| *t);
        Some(stopped_at.unwrap_or_else(Instant::now).duration_since(started_at))
    }

    /// Whether a session was started and not yet stopped
    pub fn is_active(&self) -> bool {
        let started = self.started_at.read().map(|t| t.is_some()).unwrap_or(false);
        let stopped = self.stopped_at.read().map(|t| t.is_some()).unwrap_or(false);
        started && !stopped
    }

    pub fn record_sent(&self, bytes: usize, latency: Duration) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.record_sample(bytes, latency);
    }

    pub fn record_received(&self, bytes: usize, latency: Duration) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.record_sample(bytes, latency);
    }

    /// Bytes from a read-back; does not count as a packet
    pub fn record_read_back(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        if let Ok(mut throughput) = self.throughput.write() {
            throughput.add_sample(bytes as u64);
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_sample(&self, bytes: usize, latency: Duration) {
        if let Ok(mut window) = self.latency.write() {
            window.add_sample(latency.as_micros() as u64);
        }
        if let Ok(mut window) = self.throughput.write() {
            window.add_sample(bytes as u64);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let latency = self
            .latency
            .read()
            .map(|window| LatencyStats {
                min_us: window.min().unwrap_or(0),
                max_us: window.max().unwrap_or(0),
                avg_us: window.avg().unwrap_or(0),
            })
            .unwrap_or_default();
        let throughput_bps = self
            .throughput
            .read()
            .map(|window| window.rate_per_second())
            .unwrap_or(0.0);

        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            latency,
            throughput_bps,
            elapsed: self.elapsed(),
        }
    }
}

/// Point-in-time copy of [`TrafficStats`]
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub packets: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub latency: LatencyStats,
    pub throughput_bps: f64,
    pub elapsed: Option<Duration>,
}

impl StatsSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }

    /// Failed iterations (errors and timeouts) over all iterations
    pub fn failure_rate(&self) -> f64 {
        let failed = self.errors + self.timeouts;
        let total = self.packets + failed;
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }
}

/// Format a byte count with a binary unit
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Format a throughput in bytes per second
pub fn format_rate(bytes_per_second: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_second.max(0.0) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = TrafficStats::new();
        stats.record_sent(64, Duration::from_micros(200));
        stats.record_sent(64, Duration::from_micros(400));
        stats.record_read_back(32);
        stats.record_error();
        stats.record_timeout();

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.bytes_sent, 128);
        assert_eq!(snap.bytes_received, 32);
        assert_eq!(snap.total_bytes(), 160);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.latency.min_us, 200);
        assert_eq!(snap.latency.max_us, 400);
        assert_eq!(snap.latency.avg_us, 300);
    }

    #[test]
    fn test_reset_clears_and_starts_clock() {
        let stats = TrafficStats::new();
        assert!(stats.elapsed().is_none());

        stats.record_received(10, Duration::from_millis(1));
        stats.reset();

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 0);
        assert_eq!(snap.bytes_received, 0);
        assert!(snap.elapsed.is_some());
        assert!(stats.is_active());

        stats.mark_stopped();
        assert!(!stats.is_active());
        let frozen = stats.elapsed().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(stats.elapsed(), Some(frozen));
    }

    #[test]
    fn test_failure_rate() {
        let snap = StatsSnapshot {
            packets: 3,
            errors: 1,
            ..Default::default()
        };
        assert!((snap.failure_rate() - 0.25).abs() < f64::EPSILON);
        assert_eq!(StatsSnapshot::default().failure_rate(), 0.0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 / 2), "1.50 MiB");
        assert_eq!(format_rate(2048.0), "2.00 KiB/s");
    }

    #[test]
    fn test_window_is_bounded() {
        let stats = TrafficStats::new();
        for _ in 0..(ROLLING_WINDOW_SIZE * 2) {
            stats.record_sent(1, Duration::from_micros(1));
        }
        let latency = stats.latency.read().unwrap();
        assert!(latency.samples.len() <= ROLLING_WINDOW_SIZE);
    }
}
