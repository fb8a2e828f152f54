//! Throughput from monotonically increasing byte counters.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Observation {
    sent: u64,
    recv: u64,
    at: Instant,
}

/// Tracks the last cumulative (sent, recv) totals and turns the next pair into bytes/sec.
#[derive(Debug, Default)]
pub struct RateCalculator {
    last: Option<Observation>,
}

impl RateCalculator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns (sent_rate, recv_rate). The first call only seeds the baseline and
    /// reports (0, 0). A counter that went backwards (interface reset) yields 0 for
    /// that direction. A non-positive elapsed time is treated as one second.
    pub fn observe(&mut self, sent: u64, recv: u64, now: Instant) -> (f64, f64) {
        let rates = match self.last {
            None => (0.0, 0.0),
            Some(prev) => {
                let elapsed = now
                    .checked_duration_since(prev.at)
                    .filter(|d| !d.is_zero())
                    .unwrap_or(Duration::from_secs(1))
                    .as_secs_f64();
                (
                    sent.saturating_sub(prev.sent) as f64 / elapsed,
                    recv.saturating_sub(prev.recv) as f64 / elapsed,
                )
            }
        };
        self.last = Some(Observation {
            sent,
            recv,
            at: now,
        });
        rates
    }
}
