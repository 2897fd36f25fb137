//! Splitting a logical message into wire-sized fragments.

use crate::packet::{Packet, PacketType, DEFAULT_MAX_PAYLOAD};

/// Split `payload` into contiguous fragments of at most `max_payload_size`
/// bytes, all carrying `id` and numbered 1..=N. A payload that fits emits a
/// single inherently-complete packet. A zero `max_payload_size` falls back
/// to [`DEFAULT_MAX_PAYLOAD`].
pub fn fragment(
    id: u32,
    packet_type: PacketType,
    payload: &[u8],
    max_payload_size: usize,
) -> Vec<Packet> {
    let max = if max_payload_size == 0 {
        DEFAULT_MAX_PAYLOAD
    } else {
        max_payload_size
    };

    if payload.len() <= max {
        return vec![Packet::new(id, packet_type, payload.to_vec())];
    }

    let total = payload.len().div_ceil(max) as u16;
    payload
        .chunks(max)
        .enumerate()
        .map(|(idx, chunk)| Packet {
            id,
            packet_type,
            total_packets: total,
            packet_number: idx as u16 + 1,
            payload: chunk.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::empty(0, 16, 1)]
    #[case::fits_exactly(16, 16, 1)]
    #[case::one_over(17, 16, 2)]
    #[case::three_way_split(1500, 512, 3)]
    #[case::default_max(3000, 0, 3)]
    fn test_fragment_count(#[case] len: usize, #[case] max: usize, #[case] expected: u16) {
        let payload = vec![7u8; len];
        let packets = fragment(4, PacketType::Request, &payload, max);

        assert_eq!(packets.len(), expected as usize);
        for (idx, packet) in packets.iter().enumerate() {
            assert_eq!(packet.id, 4);
            assert_eq!(packet.packet_type, PacketType::Request);
            assert_eq!(packet.total_packets, expected);
            assert_eq!(packet.packet_number, idx as u16 + 1);
        }
    }

    #[test]
    fn test_fragmentation_is_lossless() {
        let payload: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        let packets = fragment(1, PacketType::Request, &payload, 512);

        assert_eq!(
            packets.iter().map(|p| p.payload.len()).collect::<Vec<_>>(),
            vec![512, 512, 476]
        );

        let reassembled: Vec<u8> = packets.iter().flat_map(|p| p.payload.clone()).collect();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn test_single_packet_is_inherently_complete() {
        let packets = fragment(2, PacketType::Response, b"200 golang", 1024);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].total_packets, 1);
        assert_eq!(packets[0].packet_number, 1);
        assert!(!packets[0].is_fragmented());
    }
}
