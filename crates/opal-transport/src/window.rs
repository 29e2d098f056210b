//! Timing windows: ACK history for RTT measurement and packet-arrival
//! history for receive-rate and link-capacity estimation.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const ACK_WINDOW_CAP: usize = 1024;
const ARRIVAL_SAMPLES: usize = 16;
const PROBE_SAMPLES: usize = 64;

/// Ring of outstanding acknowledgments awaiting their ACK-of-ACK.
#[derive(Debug)]
pub struct AckWindow {
    entries: VecDeque<(u32, u32, Instant)>,
}

impl AckWindow {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(64),
        }
    }

    /// Records that the acknowledgment numbered `ack_no` covering `ack_seq`
    /// was sent at `now`.
    pub fn store(&mut self, ack_no: u32, ack_seq: u32, now: Instant) {
        if self.entries.len() == ACK_WINDOW_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back((ack_no, ack_seq, now));
    }

    /// Matches an arriving ACK-of-ACK against the stored send time. Returns
    /// the acknowledged sequence and the measured round trip. Entries older
    /// than the match are discarded; a stale or unknown `ack_no` yields
    /// `None`.
    pub fn acknowledge(&mut self, ack_no: u32, now: Instant) -> Option<(u32, Duration)> {
        let pos = self.entries.iter().position(|&(no, _, _)| no == ack_no)?;
        let (_, ack_seq, sent) = self.entries[pos];
        self.entries.drain(..=pos);
        Some((ack_seq, now.duration_since(sent)))
    }
}

impl Default for AckWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Packet-arrival history. Inter-arrival intervals estimate the delivery
/// rate; intervals within back-to-back probe pairs estimate link capacity.
#[derive(Debug)]
pub struct ArrivalWindow {
    intervals_us: VecDeque<u64>,
    probes_us: VecDeque<u64>,
    last_arrival: Option<Instant>,
    probe_start: Option<Instant>,
}

impl ArrivalWindow {
    pub fn new() -> Self {
        Self {
            intervals_us: VecDeque::with_capacity(ARRIVAL_SAMPLES),
            probes_us: VecDeque::with_capacity(PROBE_SAMPLES),
            last_arrival: None,
            probe_start: None,
        }
    }

    /// Records a data-packet arrival.
    pub fn on_arrival(&mut self, now: Instant) {
        if let Some(last) = self.last_arrival {
            let us = now.duration_since(last).as_micros() as u64;
            if self.intervals_us.len() == ARRIVAL_SAMPLES {
                self.intervals_us.pop_front();
            }
            self.intervals_us.push_back(us);
        }
        self.last_arrival = Some(now);
    }

    /// First packet of a probe pair arrived.
    pub fn on_probe_first(&mut self, now: Instant) {
        self.probe_start = Some(now);
    }

    /// Second packet of a probe pair arrived; the pair's spacing is a
    /// capacity sample. Ignored when the first packet was lost.
    pub fn on_probe_second(&mut self, now: Instant) {
        if let Some(start) = self.probe_start.take() {
            let us = now.duration_since(start).as_micros() as u64;
            if us == 0 {
                return;
            }
            if self.probes_us.len() == PROBE_SAMPLES {
                self.probes_us.pop_front();
            }
            self.probes_us.push_back(us);
        }
    }

    /// Receive rate in packets/second, or 0 while the sample set is too
    /// small or too scattered to trust.
    pub fn recv_rate_pps(&self) -> u32 {
        Self::robust_rate(&self.intervals_us, ARRIVAL_SAMPLES / 2)
    }

    /// Estimated link capacity in packets/second from probe-pair spacing.
    pub fn bandwidth_pps(&self) -> u32 {
        Self::robust_rate(&self.probes_us, 2)
    }

    /// Converts an interval sample set to a rate, discarding outliers more
    /// than 8x away from the median in either direction.
    fn robust_rate(samples: &VecDeque<u64>, min_valid: usize) -> u32 {
        if samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = samples.iter().copied().collect();
        sorted.sort_unstable();
        let median = sorted[sorted.len() / 2].max(1);
        let (mut sum, mut n) = (0u64, 0u64);
        for &s in &sorted {
            if s > median / 8 && s < median.saturating_mul(8) {
                sum += s;
                n += 1;
            }
        }
        if (n as usize) < min_valid || sum == 0 {
            return 0;
        }
        (1_000_000 * n / sum) as u32
    }
}

impl Default for ArrivalWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_window_matches_rtt() {
        let mut win = AckWindow::new();
        let t0 = Instant::now();
        win.store(1, 100, t0);
        win.store(2, 110, t0 + Duration::from_millis(10));

        let (seq, rtt) = win
            .acknowledge(2, t0 + Duration::from_millis(30))
            .unwrap();
        assert_eq!(seq, 110);
        assert_eq!(rtt, Duration::from_millis(20));
        // Entry 1 was older than the match and is gone.
        assert!(win.acknowledge(1, t0 + Duration::from_millis(40)).is_none());
    }

    #[test]
    fn test_ack_window_unknown_no() {
        let mut win = AckWindow::new();
        win.store(5, 1, Instant::now());
        assert!(win.acknowledge(99, Instant::now()).is_none());
    }

    #[test]
    fn test_arrival_rate_converges() {
        let mut win = ArrivalWindow::new();
        let t0 = Instant::now();
        // One packet every 1000us -> 1000 packets/s.
        for i in 0..ARRIVAL_SAMPLES as u64 + 1 {
            win.on_arrival(t0 + Duration::from_micros(i * 1000));
        }
        let rate = win.recv_rate_pps();
        assert!((900..=1100).contains(&rate), "rate {}", rate);
    }

    #[test]
    fn test_arrival_rate_ignores_outliers() {
        let mut win = ArrivalWindow::new();
        let mut t = Instant::now();
        for i in 0..ARRIVAL_SAMPLES as u64 + 1 {
            win.on_arrival(t);
            // One huge gap (idle period) among steady 1ms arrivals.
            let step = if i == 8 { 1_000_000 } else { 1000 };
            t += Duration::from_micros(step);
        }
        let rate = win.recv_rate_pps();
        assert!((900..=1100).contains(&rate), "rate {}", rate);
    }

    #[test]
    fn test_probe_pairs_estimate_capacity() {
        let mut win = ArrivalWindow::new();
        let t0 = Instant::now();
        // Pairs spaced 100us apart -> 10000 packets/s capacity.
        for i in 0..4u64 {
            let base = t0 + Duration::from_millis(i * 10);
            win.on_probe_first(base);
            win.on_probe_second(base + Duration::from_micros(100));
        }
        let bw = win.bandwidth_pps();
        assert!((9000..=11000).contains(&bw), "bw {}", bw);
    }

    #[test]
    fn test_probe_second_without_first_ignored() {
        let mut win = ArrivalWindow::new();
        win.on_probe_second(Instant::now());
        assert_eq!(win.bandwidth_pps(), 0);
    }

    #[test]
    fn test_rate_requires_enough_samples() {
        let mut win = ArrivalWindow::new();
        let t0 = Instant::now();
        win.on_arrival(t0);
        win.on_arrival(t0 + Duration::from_micros(1000));
        assert_eq!(win.recv_rate_pps(), 0);
    }
}
