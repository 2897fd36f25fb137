//! Receive-side buffering of fragmented messages.
//!
//! Fragments may arrive in any order and duplicated; the buffer collects
//! them per message id until every number 1..=total is present, then hands
//! back the concatenated payload and forgets the message. Partial messages
//! that see no new fragment within the expiry interval are dropped, so a
//! late straggler for a purged id simply starts a fresh entry.

use rustc_hash::FxHashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::ProtocolError;
use crate::packet::Packet;

pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

/// One partially received multi-fragment message.
struct FragmentedMessage {
    total_packets: u16,
    /// payloads keyed by 1-indexed fragment number
    fragments: FxHashMap<u16, Vec<u8>>,
    last_update: Instant,
}

impl FragmentedMessage {
    fn is_complete(&self) -> bool {
        self.fragments.len() == self.total_packets as usize
    }

    fn assemble(self) -> Vec<u8> {
        let mut payload = Vec::new();
        for number in 1..=self.total_packets {
            if let Some(fragment) = self.fragments.get(&number) {
                payload.extend_from_slice(fragment);
            }
        }
        payload
    }
}

pub struct ReassemblyBuffer {
    messages: FxHashMap<u32, FragmentedMessage>,
    timeout: Duration,
    last_cleanup: Instant,
}

impl ReassemblyBuffer {
    pub fn new(timeout: Duration) -> ReassemblyBuffer {
        ReassemblyBuffer {
            messages: FxHashMap::default(),
            timeout,
            last_cleanup: Instant::now(),
        }
    }

    /// Feed one integrity-checked fragment.
    ///
    /// Returns the assembled payload when the message just completed, `None`
    /// while fragments are still outstanding. Duplicate fragment numbers
    /// overwrite (all copies carry identical CRC-checked bytes). A fragment
    /// whose `total_packets` disagrees with the existing entry is rejected
    /// and the partial message is left intact.
    pub fn add(&mut self, packet: &Packet) -> Result<Option<Vec<u8>>, ProtocolError> {
        let now = Instant::now();
        if now.duration_since(self.last_cleanup) > self.timeout {
            self.expire(now);
            self.last_cleanup = now;
        }

        if packet.total_packets == 1 {
            return Ok(Some(packet.payload.clone()));
        }

        let msg = self
            .messages
            .entry(packet.id)
            .or_insert_with(|| FragmentedMessage {
                total_packets: packet.total_packets,
                fragments: FxHashMap::default(),
                last_update: now,
            });

        if msg.total_packets != packet.total_packets {
            return Err(ProtocolError::FragmentMismatch {
                id: packet.id,
                packet_number: packet.packet_number,
                total_packets: packet.total_packets,
                expected_total: msg.total_packets,
            });
        }

        msg.fragments
            .insert(packet.packet_number, packet.payload.clone());
        msg.last_update = now;
        let complete = msg.is_complete();

        if complete {
            let msg = self
                .messages
                .remove(&packet.id)
                .expect("entry was just updated");
            return Ok(Some(msg.assemble()));
        }
        Ok(None)
    }

    /// `(received, total, percent)` for an in-flight message; zeroes when
    /// the id is unknown.
    pub fn progress(&self, id: u32) -> (usize, usize, f64) {
        match self.messages.get(&id) {
            Some(msg) => {
                let received = msg.fragments.len();
                let total = msg.total_packets as usize;
                (received, total, received as f64 / total as f64 * 100.0)
            }
            None => (0, 0, 0.0),
        }
    }

    /// Fragment numbers not yet received for an in-flight message.
    pub fn missing(&self, id: u32) -> Vec<u16> {
        match self.messages.get(&id) {
            Some(msg) => (1..=msg.total_packets)
                .filter(|number| !msg.fragments.contains_key(number))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Drop every partial message whose last fragment is older than the
    /// expiry interval.
    pub fn cleanup(&mut self) {
        let now = Instant::now();
        self.expire(now);
        self.last_cleanup = now;
    }

    pub fn pending(&self) -> usize {
        self.messages.len()
    }

    fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.messages
            .retain(|_, msg| now.duration_since(msg.last_update) <= timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use rstest::rstest;
    use std::time::Duration;

    fn fragments_of(id: u32, payload: &[u8], max: usize) -> Vec<Packet> {
        crate::fragment::fragment(id, PacketType::Request, payload, max)
    }

    #[test]
    fn test_single_packet_completes_without_buffering() {
        let mut buffer = ReassemblyBuffer::new(DEFAULT_REASSEMBLY_TIMEOUT);
        let packet = Packet::new(1, PacketType::Request, b"LIST".to_vec());

        let payload = buffer.add(&packet).unwrap();
        assert_eq!(payload, Some(b"LIST".to_vec()));
        assert_eq!(buffer.pending(), 0);
    }

    #[rstest]
    #[case::in_order(vec![1, 2, 3])]
    #[case::reversed(vec![3, 2, 1])]
    #[case::interleaved(vec![3, 1, 2])]
    fn test_any_permutation_assembles(#[case] order: Vec<usize>) {
        let payload: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
        let fragments = fragments_of(7, &payload, 512);
        let mut buffer = ReassemblyBuffer::new(DEFAULT_REASSEMBLY_TIMEOUT);

        let mut result = None;
        for (step, &idx) in order.iter().enumerate() {
            let outcome = buffer.add(&fragments[idx - 1]).unwrap();
            if step + 1 < order.len() {
                assert_eq!(outcome, None, "completed before the last fragment");
            } else {
                result = outcome;
            }
        }
        assert_eq!(result, Some(payload));
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_duplicate_fragments_overwrite() {
        let fragments = fragments_of(3, &[9u8; 1200], 512);
        let mut buffer = ReassemblyBuffer::new(DEFAULT_REASSEMBLY_TIMEOUT);

        assert_eq!(buffer.add(&fragments[0]).unwrap(), None);
        assert_eq!(buffer.add(&fragments[0]).unwrap(), None);
        let (received, total, _) = buffer.progress(3);
        assert_eq!((received, total), (1, 3));

        assert_eq!(buffer.add(&fragments[1]).unwrap(), None);
        assert_eq!(
            buffer.add(&fragments[2]).unwrap(),
            Some(vec![9u8; 1200])
        );
    }

    #[test]
    fn test_total_mismatch_leaves_partial_intact() {
        let fragments = fragments_of(5, &[1u8; 1200], 512);
        let mut buffer = ReassemblyBuffer::new(DEFAULT_REASSEMBLY_TIMEOUT);
        buffer.add(&fragments[0]).unwrap();

        let conflicting = Packet {
            id: 5,
            packet_type: PacketType::Request,
            total_packets: 7,
            packet_number: 2,
            payload: vec![2u8; 512],
        };
        let result = buffer.add(&conflicting);
        assert_eq!(
            result,
            Err(ProtocolError::FragmentMismatch {
                id: 5,
                packet_number: 2,
                total_packets: 7,
                expected_total: 3,
            })
        );
        let (received, total, _) = buffer.progress(5);
        assert_eq!((received, total), (1, 3));
    }

    #[test]
    fn test_missing_and_progress() {
        let fragments = fragments_of(11, &[0u8; 2000], 512);
        let mut buffer = ReassemblyBuffer::new(DEFAULT_REASSEMBLY_TIMEOUT);

        buffer.add(&fragments[1]).unwrap();
        buffer.add(&fragments[3]).unwrap();

        assert_eq!(buffer.missing(11), vec![1, 3]);
        assert_eq!(buffer.progress(11), (2, 4, 50.0));
        assert_eq!(buffer.missing(999), Vec::<u16>::new());
        assert_eq!(buffer.progress(999), (0, 0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_partial_expires_and_id_restarts_fresh() {
        let fragments = fragments_of(21, &[4u8; 1200], 512);
        let mut buffer = ReassemblyBuffer::new(Duration::from_secs(5));

        buffer.add(&fragments[0]).unwrap();
        assert_eq!(buffer.pending(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        buffer.cleanup();
        assert_eq!(buffer.pending(), 0);

        // a straggler for the purged id is treated as a fresh message
        assert_eq!(buffer.add(&fragments[1]).unwrap(), None);
        let (received, total, _) = buffer.progress(21);
        assert_eq!((received, total), (1, 3));
        assert_eq!(buffer.missing(21), vec![1, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_runs_opportunistically_on_add() {
        let stale = fragments_of(1, &[0u8; 1200], 512);
        let fresh = fragments_of(2, &[0u8; 1200], 512);
        let mut buffer = ReassemblyBuffer::new(Duration::from_secs(5));

        buffer.add(&stale[0]).unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;

        // this add is more than the expiry interval after the last sweep
        buffer.add(&fresh[0]).unwrap();
        assert_eq!(buffer.pending(), 1);
        assert_eq!(buffer.progress(1), (0, 0, 0.0));
    }
}
