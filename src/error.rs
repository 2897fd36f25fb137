use thiserror::Error;

/// Errors raised while decoding datagrams or reassembling fragments.
///
/// None of these are fatal to a peer: the offending datagram or fragment is
/// dropped with a warning and the receive loop keeps running. There is no
/// negative acknowledgement on the wire.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("checksum mismatch: stored {stored:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { stored: u16, computed: u16 },

    #[error("fragment {packet_number}/{total_packets} conflicts with message {id} expecting {expected_total} fragments")]
    FragmentMismatch {
        id: u32,
        packet_number: u16,
        total_packets: u16,
        expected_total: u16,
    },
}
