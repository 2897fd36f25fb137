//! Send-side delivery tracking and retransmission scheduling.
//!
//! Every tracked packet is keyed by its message id. Retransmission uses a
//! linear backoff: the effective timeout for an entry is
//! `ack_timeout * (retry_count + 1)`, so the interval between successive
//! attempts is non-decreasing. An entry that has exhausted `max_retries`
//! without an ACK is retired to the lost set and never surfaced to the
//! peer; the peer runs into its own read deadline instead.

use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt::{self, Display};
use std::time::Duration;
use tokio::time::Instant;

use crate::packet::Packet;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Acked entries older than this multiple of the ack timeout are swept.
const CLEANUP_CUTOFF_FACTOR: u32 = 10;

pub struct SentPacket {
    pub packet: Packet,
    pub first_sent: Instant,
    pub last_sent: Instant,
    pub retry_count: u32,
    pub acked: bool,
    pub ack_time: Option<Instant>,
}

pub struct ReliabilityManager {
    sent: FxHashMap<u32, SentPacket>,
    acked: FxHashSet<u32>,
    lost: FxHashSet<u32>,
    ack_timeout: Duration,
    max_retries: u32,
    total_tracked: u64,
    total_retransmits: u64,
    latencies: Vec<Duration>,
}

impl ReliabilityManager {
    pub fn new(ack_timeout: Duration, max_retries: u32) -> ReliabilityManager {
        ReliabilityManager {
            sent: FxHashMap::default(),
            acked: FxHashSet::default(),
            lost: FxHashSet::default(),
            ack_timeout,
            max_retries,
            total_tracked: 0,
            total_retransmits: 0,
            latencies: Vec::new(),
        }
    }

    /// Record a send. A second call for the same id is a retransmission:
    /// the retry count is bumped and the last-sent time reset.
    pub fn track_sent(&mut self, packet: &Packet) {
        let now = Instant::now();
        match self.sent.get_mut(&packet.id) {
            Some(entry) => {
                entry.retry_count += 1;
                entry.last_sent = now;
                self.total_retransmits += 1;
            }
            None => {
                self.sent.insert(
                    packet.id,
                    SentPacket {
                        packet: packet.clone(),
                        first_sent: now,
                        last_sent: now,
                        retry_count: 0,
                        acked: false,
                        ack_time: None,
                    },
                );
                self.total_tracked += 1;
            }
        }
    }

    /// Mark an id acknowledged, recording the first-send-to-ack latency.
    /// Returns false when the id is not tracked; the caller logs a warning.
    pub fn mark_ack(&mut self, id: u32) -> bool {
        let Some(entry) = self.sent.get_mut(&id) else {
            return false;
        };
        let now = Instant::now();
        if !entry.acked {
            entry.acked = true;
            entry.ack_time = Some(now);
            self.latencies.push(now.duration_since(entry.first_sent));
            self.acked.insert(id);
        }
        true
    }

    /// Packets whose effective timeout has elapsed and that still have
    /// retries left. Entries that have exhausted their retries are retired
    /// to the lost set as a side effect. The caller resends each candidate
    /// and calls [`track_sent`](Self::track_sent) again.
    pub fn retransmit_candidates(&mut self) -> Vec<Packet> {
        let now = Instant::now();
        let mut candidates = Vec::new();
        let mut exhausted = Vec::new();

        for (&id, entry) in &self.sent {
            if entry.acked {
                continue;
            }
            let effective_timeout = self.ack_timeout * (entry.retry_count + 1);
            if now.duration_since(entry.last_sent) <= effective_timeout {
                continue;
            }
            if entry.retry_count < self.max_retries {
                candidates.push(entry.packet.clone());
            } else {
                exhausted.push(id);
            }
        }

        for id in exhausted {
            self.sent.remove(&id);
            self.lost.insert(id);
        }
        candidates
    }

    pub fn is_acked(&self, id: u32) -> bool {
        self.acked.contains(&id)
    }

    pub fn can_retransmit(&self, id: u32) -> bool {
        match self.sent.get(&id) {
            Some(entry) => !entry.acked && entry.retry_count < self.max_retries,
            None => false,
        }
    }

    /// Number of tracked packets still waiting for an ACK.
    pub fn pending_acks(&self) -> usize {
        self.sent.values().filter(|entry| !entry.acked).count()
    }

    /// Drop acked entries whose last send is older than ten ack timeouts.
    pub fn cleanup_old(&mut self) {
        let now = Instant::now();
        let cutoff = self.ack_timeout * CLEANUP_CUTOFF_FACTOR;
        self.sent
            .retain(|_, entry| !(entry.acked && now.duration_since(entry.last_sent) > cutoff));
    }

    pub fn metrics(&self) -> TransferMetrics {
        let sent = self.total_tracked;
        let acked = self.acked.len() as u64;
        let lost = self.lost.len() as u64;

        let (mut min, mut max, mut sum) = (None, None, Duration::ZERO);
        for &latency in &self.latencies {
            sum += latency;
            min = Some(min.map_or(latency, |m: Duration| m.min(latency)));
            max = Some(max.map_or(latency, |m: Duration| m.max(latency)));
        }
        let avg = (!self.latencies.is_empty()).then(|| sum / self.latencies.len() as u32);

        TransferMetrics {
            sent,
            acked,
            lost,
            retransmits: self.total_retransmits,
            loss_rate: if sent > 0 { lost as f64 / sent as f64 } else { 0.0 },
            retransmit_rate: if sent > 0 {
                self.total_retransmits as f64 / sent as f64
            } else {
                0.0
            },
            min_latency: min,
            avg_latency: avg,
            max_latency: max,
        }
    }

    pub fn is_healthy(&self) -> bool {
        let metrics = self.metrics();
        metrics.loss_rate < 0.5 && metrics.retransmit_rate < 1.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferMetrics {
    pub sent: u64,
    pub acked: u64,
    pub lost: u64,
    pub retransmits: u64,
    pub loss_rate: f64,
    pub retransmit_rate: f64,
    pub min_latency: Option<Duration>,
    pub avg_latency: Option<Duration>,
    pub max_latency: Option<Duration>,
}

impl Display for TransferMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent:{} acked:{} lost:{} retrans:{} loss:{:.2}% avg:{}ms",
            self.sent,
            self.acked,
            self.lost,
            self.retransmits,
            self.loss_rate * 100.0,
            self.avg_latency.unwrap_or(Duration::ZERO).as_millis(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use rstest::rstest;

    fn request(id: u32) -> Packet {
        Packet::new(id, PacketType::Request, b"LIST".to_vec())
    }

    fn manager() -> ReliabilityManager {
        ReliabilityManager::new(DEFAULT_ACK_TIMEOUT, DEFAULT_MAX_RETRIES)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_before_timeout_stops_retransmission() {
        let mut rm = manager();
        rm.track_sent(&request(1));

        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(rm.mark_ack(1));
        assert!(rm.is_acked(1));
        assert_eq!(rm.pending_acks(), 0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(rm.retransmit_candidates().is_empty());

        let metrics = rm.metrics();
        assert_eq!((metrics.sent, metrics.acked, metrics.lost), (1, 1, 0));
        assert_eq!(metrics.min_latency, Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_ack_for_unknown_id_is_not_fatal() {
        let mut rm = manager();
        assert!(!rm.mark_ack(99));
        assert!(!rm.is_acked(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_acked_packet_is_sent_at_most_one_plus_max_retries_times() {
        let mut rm = manager();
        let packet = request(7);
        rm.track_sent(&packet);
        let mut sends = 1;

        // drive the tick far past every conceivable timeout, resending
        // whenever the manager offers a candidate
        for _ in 0..50 {
            tokio::time::advance(Duration::from_secs(30)).await;
            for candidate in rm.retransmit_candidates() {
                rm.track_sent(&candidate);
                sends += 1;
            }
        }

        assert_eq!(sends, 1 + DEFAULT_MAX_RETRIES);
        assert!(!rm.can_retransmit(7));
        // retired to the lost set after exhausting its retries
        assert_eq!(rm.pending_acks(), 0);
        let metrics = rm.metrics();
        assert_eq!(metrics.lost, 1);
        assert_eq!(metrics.retransmits, DEFAULT_MAX_RETRIES as u64);
    }

    #[rstest]
    #[case::first_retry(0, 2)]
    #[case::second_retry(1, 4)]
    #[case::third_retry(2, 6)]
    fn test_backoff_is_linear_in_retry_count(#[case] retries: u32, #[case] timeout_secs: u64) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();
        rt.block_on(async move {
            let mut rm = manager();
            let packet = request(3);
            rm.track_sent(&packet);
            for _ in 0..retries {
                tokio::time::advance(Duration::from_secs(30)).await;
                let candidates = rm.retransmit_candidates();
                assert_eq!(candidates.len(), 1);
                rm.track_sent(&candidates[0]);
            }

            // just inside the effective timeout: nothing to resend
            tokio::time::advance(Duration::from_secs(timeout_secs)).await;
            assert!(rm.retransmit_candidates().is_empty());

            // just past it: the packet comes back as a candidate
            tokio::time::advance(Duration::from_millis(1)).await;
            assert_eq!(rm.retransmit_candidates(), vec![packet]);
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_old_drops_only_stale_acked_entries() {
        let mut rm = manager();
        rm.track_sent(&request(1));
        rm.track_sent(&request(2));
        rm.mark_ack(1);

        // past the 10x cutoff for both entries
        tokio::time::advance(Duration::from_secs(21)).await;
        rm.track_sent(&request(3));
        rm.mark_ack(3);
        rm.cleanup_old();

        // 1 was acked and stale: gone; 2 is unacked: kept; 3 is fresh: kept
        assert!(!rm.can_retransmit(1));
        assert!(rm.can_retransmit(2));
        assert!(rm.is_acked(3));
        assert_eq!(rm.pending_acks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_and_health() {
        let mut rm = manager();
        for id in 1..=4 {
            rm.track_sent(&request(id));
        }
        tokio::time::advance(Duration::from_millis(10)).await;
        rm.mark_ack(1);
        tokio::time::advance(Duration::from_millis(20)).await;
        rm.mark_ack(2);

        let metrics = rm.metrics();
        assert_eq!((metrics.sent, metrics.acked, metrics.lost), (4, 2, 0));
        assert_eq!(metrics.min_latency, Some(Duration::from_millis(10)));
        assert_eq!(metrics.max_latency, Some(Duration::from_millis(30)));
        assert_eq!(metrics.avg_latency, Some(Duration::from_millis(20)));
        assert!(rm.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_when_losses_dominate() {
        let mut rm = manager();
        for id in 1..=2 {
            rm.track_sent(&request(id));
        }
        // exhaust both entries without a single ACK
        for _ in 0..50 {
            tokio::time::advance(Duration::from_secs(30)).await;
            for candidate in rm.retransmit_candidates() {
                rm.track_sent(&candidate);
            }
        }

        let metrics = rm.metrics();
        assert_eq!(metrics.lost, 2);
        assert_eq!(metrics.loss_rate, 1.0);
        assert!(!rm.is_healthy());
    }
}
