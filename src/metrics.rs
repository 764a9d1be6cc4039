use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters mutated from the hot read/write/sweep paths with relaxed atomics;
///  read-only to callers through [`snapshot`](TransportMetrics::snapshot).
#[derive(Default)]
pub struct TransportMetrics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_retransmitted: AtomicU64,
    duplicate_drops: AtomicU64,
    reassemblies_expired: AtomicU64,
    delivery_overflow_drops: AtomicU64,
    messages_delivered: AtomicU64,
    send_timeouts: AtomicU64,
    /// Smoothed RTT in microseconds; 0 means no sample yet.
    srtt_micros: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_retransmitted: u64,
    pub duplicate_drops: u64,
    pub reassemblies_expired: u64,
    pub delivery_overflow_drops: u64,
    pub messages_delivered: u64,
    pub send_timeouts: u64,
    pub smoothed_rtt: Option<Duration>,
}

impl TransportMetrics {
    pub fn incr_packets_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_packets_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_packets_retransmitted(&self) {
        self.packets_retransmitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_duplicate_drops(&self) {
        self.duplicate_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reassemblies_expired(&self, count: u64) {
        self.reassemblies_expired.fetch_add(count, Ordering::Relaxed);
    }

    pub fn incr_delivery_overflow_drops(&self) {
        self.delivery_overflow_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_messages_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_send_timeouts(&self) {
        self.send_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds an ack-latency sample into the smoothed estimate with the classic
    ///  `srtt = 7/8 srtt + 1/8 sample` weighting. The first sample initializes
    ///  the estimate directly.
    pub fn record_rtt_sample(&self, sample: Duration) {
        let sample_micros = (sample.as_micros() as u64).max(1);
        let _ = self.srtt_micros.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
            if prev == 0 {
                Some(sample_micros)
            } else {
                Some(prev - prev / 8 + sample_micros / 8)
            }
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let srtt_micros = self.srtt_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_retransmitted: self.packets_retransmitted.load(Ordering::Relaxed),
            duplicate_drops: self.duplicate_drops.load(Ordering::Relaxed),
            reassemblies_expired: self.reassemblies_expired.load(Ordering::Relaxed),
            delivery_overflow_drops: self.delivery_overflow_drops.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            smoothed_rtt: if srtt_micros == 0 {
                None
            } else {
                Some(Duration::from_micros(srtt_micros))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_empty() {
        let metrics = TransportMetrics::default();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_sent, 0);
        assert_eq!(snapshot.smoothed_rtt, None);
    }

    #[test]
    fn test_rtt_first_sample_initializes() {
        let metrics = TransportMetrics::default();
        metrics.record_rtt_sample(Duration::from_millis(40));
        assert_eq!(metrics.snapshot().smoothed_rtt, Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_rtt_smoothing_moves_towards_sample() {
        let metrics = TransportMetrics::default();
        metrics.record_rtt_sample(Duration::from_millis(80));
        metrics.record_rtt_sample(Duration::from_millis(8));

        let srtt = metrics.snapshot().smoothed_rtt.unwrap();
        assert!(srtt < Duration::from_millis(80));
        assert!(srtt > Duration::from_millis(8));
    }

    #[test]
    fn test_counters() {
        let metrics = TransportMetrics::default();
        metrics.incr_packets_sent();
        metrics.incr_packets_sent();
        metrics.incr_duplicate_drops();
        metrics.incr_reassemblies_expired(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.packets_sent, 2);
        assert_eq!(snapshot.duplicate_drops, 1);
        assert_eq!(snapshot.reassemblies_expired, 3);
    }
}
