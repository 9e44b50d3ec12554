//! Throttled progress and speed statistics.
//!
//! Recomputing and emitting stats per chunk would flood the caller's event
//! channel; the meter caps emission at one snapshot per
//! [`crate::config::PROGRESS_INTERVAL`] and lets terminal paths force a
//! final snapshot.

use crate::config::PROGRESS_INTERVAL;
use tokio::time::Instant;

/// A single stats sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSnapshot {
    pub bytes: u64,
    pub total_size: u64,
    pub percent: f64,
    /// Bytes per second since the meter started counting.
    pub speed_bps: f64,
}

/// Byte counter with throttled snapshots.
///
/// The clock starts on the first recorded byte (receiver semantics: elapsed
/// since first chunk) or on an explicit [`start`](Self::start) call (sender
/// semantics: elapsed since transfer start).
#[derive(Debug)]
pub struct ProgressMeter {
    total_size: u64,
    bytes: u64,
    started: Option<Instant>,
    last_emit: Option<Instant>,
}

impl ProgressMeter {
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            bytes: 0,
            started: None,
            last_emit: None,
        }
    }

    /// Pin the speed baseline to now (sender side calls this at start).
    pub fn start(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Count `n` transferred bytes, starting the clock if needed.
    pub fn record(&mut self, n: u64) {
        self.started.get_or_insert_with(Instant::now);
        self.bytes += n;
    }

    /// A snapshot if the throttle interval has elapsed, else `None`.
    pub fn due(&mut self) -> Option<ProgressSnapshot> {
        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < PROGRESS_INTERVAL {
                return None;
            }
        }
        self.last_emit = Some(now);
        Some(self.snapshot())
    }

    /// Unthrottled snapshot for terminal paths.
    pub fn snapshot(&self) -> ProgressSnapshot {
        let percent = if self.total_size == 0 {
            100.0
        } else {
            (self.bytes as f64 / self.total_size as f64) * 100.0
        };
        let speed_bps = match self.started {
            Some(started) => {
                let elapsed = started.elapsed().as_secs_f64();
                if elapsed > 0.0 {
                    self.bytes as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        ProgressSnapshot {
            bytes: self.bytes,
            total_size: self.total_size,
            percent,
            speed_bps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn emission_is_throttled_to_the_interval() {
        let mut meter = ProgressMeter::new(1000);
        meter.record(100);
        assert!(meter.due().is_some());

        // Immediately after an emission, nothing is due.
        meter.record(100);
        assert!(meter.due().is_none());

        tokio::time::sleep(PROGRESS_INTERVAL).await;
        let snap = meter.due().expect("interval elapsed");
        assert_eq!(snap.bytes, 200);
        assert!((snap.percent - 20.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn speed_uses_elapsed_since_first_byte() {
        let mut meter = ProgressMeter::new(0);
        meter.record(500);
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let snap = meter.snapshot();
        // 500 bytes over ~1 s.
        assert!(snap.speed_bps > 400.0 && snap.speed_bps < 600.0);
    }

    #[test]
    fn zero_total_reports_full_percent() {
        let meter = ProgressMeter::new(0);
        assert_eq!(meter.snapshot().percent, 100.0);
    }
}
