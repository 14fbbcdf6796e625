//! Link-quality estimation: round-trip time, clock offset, and datagram
//! loss tracking, fed by the keep-alive exchange.

use std::collections::VecDeque;
use std::time::Instant;

/// EWMA smoothing factor for new RTT samples.
const RTT_ALPHA: f64 = 0.125;

/// How many raw samples to retain for jitter inspection.
const RTT_SAMPLE_WINDOW: usize = 16;

/// Smoothed round-trip time estimator.
#[derive(Debug)]
pub struct RttEstimator {
    smoothed_ms: Option<f64>,
    samples: VecDeque<f64>,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self {
            smoothed_ms: None,
            samples: VecDeque::with_capacity(RTT_SAMPLE_WINDOW),
        }
    }

    /// Fold one measured round trip into the estimate.
    pub fn record_sample(&mut self, rtt_ms: f64) {
        if rtt_ms < 0.0 || !rtt_ms.is_finite() {
            return;
        }
        self.smoothed_ms = Some(match self.smoothed_ms {
            Some(current) => current + RTT_ALPHA * (rtt_ms - current),
            None => rtt_ms,
        });
        if self.samples.len() == RTT_SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt_ms);
    }

    /// The smoothed estimate, or `None` before the first sample.
    pub fn rtt_ms(&self) -> Option<f64> {
        self.smoothed_ms
    }

    /// Spread between the best and worst retained samples.
    pub fn jitter_ms(&self) -> f64 {
        let min = self.samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = self
            .samples
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if min.is_finite() && max.is_finite() {
            max - min
        } else {
            0.0
        }
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic session clock plus the estimated offset to the remote clock.
///
/// The offset is seeded from the handshake exchange (the server echoes the
/// client's timestamp) and refined by subsequent keep-alive acks.
#[derive(Debug)]
pub struct NetworkClock {
    epoch: Instant,
    offset_ms: f64,
}

impl NetworkClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_ms: 0.0,
        }
    }

    /// Milliseconds since this endpoint started.
    pub fn local_time_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// Local time adjusted to the remote clock's frame.
    pub fn remote_time_ms(&self) -> f64 {
        self.local_time_ms() + self.offset_ms
    }

    /// Update the offset from one echoed exchange: our send time as echoed
    /// back, the remote's time when it replied, and our receive time. The
    /// remote is assumed to have replied halfway through the round trip.
    pub fn record_exchange(&mut self, sent_ms: f64, remote_ms: f64, received_ms: f64) {
        let rtt = received_ms - sent_ms;
        if rtt < 0.0 {
            return;
        }
        self.offset_ms = remote_ms + rtt / 2.0 - received_ms;
    }

    /// Current offset estimate in milliseconds.
    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }
}

impl Default for NetworkClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Windowed datagram loss counters.
///
/// Counters accumulate within a fixed window and reset when it elapses, so
/// the reported ratio reflects recent conditions rather than the whole
/// session.
#[derive(Debug)]
pub struct LossTracker {
    sent: u32,
    received: u32,
    remote_sent: u32,
    window_started: Instant,
    window_secs: u64,
}

impl LossTracker {
    pub fn new(window_secs: u64) -> Self {
        Self {
            sent: 0,
            received: 0,
            remote_sent: 0,
            window_started: Instant::now(),
            window_secs,
        }
    }

    pub fn record_sent(&mut self) {
        self.maybe_reset();
        self.sent = self.sent.saturating_add(1);
    }

    pub fn record_received(&mut self) {
        self.maybe_reset();
        self.received = self.received.saturating_add(1);
    }

    /// Datagrams sent in the current window.
    pub fn sent(&self) -> u32 {
        self.sent
    }

    /// Datagrams received in the current window.
    pub fn received(&self) -> u32 {
        self.received
    }

    /// Record how many datagrams the remote reports having sent this
    /// window, as carried by its keep-alives.
    pub fn record_remote_sent(&mut self, remote_sent: u32) {
        self.maybe_reset();
        self.remote_sent = remote_sent;
    }

    /// Fraction of the remote's sends that never arrived, given how many it
    /// reports having sent. Clamped to `[0, 1]`; zero until traffic flows.
    pub fn loss_ratio(&self, remote_sent: u32) -> f64 {
        if remote_sent == 0 {
            return 0.0;
        }
        let lost = remote_sent.saturating_sub(self.received);
        (f64::from(lost) / f64::from(remote_sent)).clamp(0.0, 1.0)
    }

    /// Loss against the most recent remote report.
    pub fn latest_ratio(&self) -> f64 {
        self.loss_ratio(self.remote_sent)
    }

    fn maybe_reset(&mut self) {
        if self.window_started.elapsed().as_secs() >= self.window_secs {
            self.sent = 0;
            self.received = 0;
            self.remote_sent = 0;
            self.window_started = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_becomes_the_estimate() {
        let mut rtt = RttEstimator::new();
        assert!(rtt.rtt_ms().is_none());
        rtt.record_sample(40.0);
        assert_eq!(rtt.rtt_ms(), Some(40.0));
    }

    #[test]
    fn test_estimate_moves_toward_new_samples() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(100.0);
        rtt.record_sample(50.0);
        let estimate = rtt.rtt_ms().unwrap();
        assert!(estimate < 100.0 && estimate > 50.0);
    }

    #[test]
    fn test_negative_and_nan_samples_ignored() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(-5.0);
        rtt.record_sample(f64::NAN);
        assert!(rtt.rtt_ms().is_none());
    }

    #[test]
    fn test_jitter_spans_retained_samples() {
        let mut rtt = RttEstimator::new();
        rtt.record_sample(20.0);
        rtt.record_sample(35.0);
        rtt.record_sample(25.0);
        assert_eq!(rtt.jitter_ms(), 15.0);
    }

    #[test]
    fn test_clock_offset_from_symmetric_exchange() {
        let mut clock = NetworkClock::new();
        // Sent at 100, remote stamped 1060, received at 120: remote clock
        // runs 950ms ahead.
        clock.record_exchange(100.0, 1060.0, 120.0);
        assert!((clock.offset_ms() - 950.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_rejects_negative_round_trip() {
        let mut clock = NetworkClock::new();
        clock.record_exchange(200.0, 500.0, 100.0);
        assert_eq!(clock.offset_ms(), 0.0);
    }

    #[test]
    fn test_loss_ratio_against_remote_sends() {
        let mut loss = LossTracker::new(10);
        for _ in 0..8 {
            loss.record_received();
        }
        // Remote claims 10 sends, we saw 8.
        assert!((loss.loss_ratio(10) - 0.2).abs() < 1e-9);
        assert_eq!(loss.loss_ratio(0), 0.0);
    }

    #[test]
    fn test_latest_ratio_follows_the_remote_report() {
        let mut loss = LossTracker::new(10);
        assert_eq!(loss.latest_ratio(), 0.0);
        for _ in 0..6 {
            loss.record_received();
        }
        loss.record_remote_sent(8);
        assert!((loss.latest_ratio() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_loss_ratio_clamped_when_counts_disagree() {
        let mut loss = LossTracker::new(10);
        loss.record_received();
        loss.record_received();
        // Window boundaries can make us see more than the remote reports.
        assert_eq!(loss.loss_ratio(1), 0.0);
    }
}
