//! Wire codec for the datagram protocol.
//!
//! Every datagram carries exactly one packet with a fixed 13-byte header,
//! all numbers in network byte order (BE):
//!
//! ```ascii
//!  0: message id (u32) - shared by all fragments of one logical message
//!  4: packet type (u8) - REQUEST=0, RESPONSE=1, ACK=2, HEARTBEAT=3
//!  5: data size (u16) - payload byte count; must equal the actual payload length
//!  7: total packets (u16) - number of fragments in the logical message, >= 1
//!  9: packet number (u16) - 1-indexed position of this fragment
//! 11: checksum (u16) - low 16 bits of CRC-32/IEEE over the full encoded
//!      packet with this slot held at zero
//! 13: payload (data size bytes)
//! ```
//!
//! No I/O happens here - this is pure data transformation.

use bytes::{Buf, BufMut, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{self, Debug, Display};

use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 13;

/// Recommended upper bound for a single fragment's payload.
pub const DEFAULT_MAX_PAYLOAD: usize = 1024;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
const CHECKSUM_OFFSET: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 1,
    Ack = 2,
    Heartbeat = 3,
}

impl Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PacketType::Request => "REQUEST",
            PacketType::Response => "RESPONSE",
            PacketType::Ack => "ACK",
            PacketType::Heartbeat => "HEARTBEAT",
        };
        f.write_str(s)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub packet_type: PacketType,
    pub total_packets: u16,
    pub packet_number: u16,
    pub payload: Vec<u8>,
}

impl Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet{{id:{}, type:{}, {}/{}, {} bytes}}",
            self.id,
            self.packet_type,
            self.packet_number,
            self.total_packets,
            self.payload.len()
        )
    }
}

impl Packet {
    /// A self-contained single-fragment packet.
    pub fn new(id: u32, packet_type: PacketType, payload: Vec<u8>) -> Packet {
        Packet {
            id,
            packet_type,
            total_packets: 1,
            packet_number: 1,
            payload,
        }
    }

    /// Zero-payload acknowledgement for the given message id.
    pub fn ack(id: u32) -> Packet {
        Packet::new(id, PacketType::Ack, Vec::new())
    }

    pub fn heartbeat(id: u32) -> Packet {
        Packet::new(id, PacketType::Heartbeat, Vec::new())
    }

    pub fn is_fragmented(&self) -> bool {
        self.total_packets > 1
    }

    /// Serialise header and payload, then patch the checksum into its slot.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= u16::MAX as usize);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.id);
        buf.put_u8(self.packet_type.into());
        buf.put_u16(self.payload.len() as u16);
        buf.put_u16(self.total_packets);
        buf.put_u16(self.packet_number);
        buf.put_u16(0); // checksum slot, patched below
        buf.put_slice(&self.payload);

        let checksum = wire_checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
        buf.to_vec()
    }

    /// Parse and verify a received datagram.
    ///
    /// The checksum is verified before any field is trusted; `data_size`
    /// must match the actual payload length and the fragment numbering must
    /// satisfy `1 <= packet_number <= total_packets`.
    pub fn decode(data: &[u8]) -> Result<Packet, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::MalformedPacket(format!(
                "{} bytes is shorter than the {} byte header",
                data.len(),
                HEADER_LEN
            )));
        }

        let stored = u16::from_be_bytes([data[CHECKSUM_OFFSET], data[CHECKSUM_OFFSET + 1]]);
        let computed = wire_checksum(data);
        if stored != computed {
            return Err(ProtocolError::ChecksumMismatch { stored, computed });
        }

        let mut header = &data[..HEADER_LEN];
        let id = header.get_u32();
        let type_code = header.get_u8();
        let data_size = header.get_u16();
        let total_packets = header.get_u16();
        let packet_number = header.get_u16();

        let packet_type = PacketType::try_from(type_code).map_err(|_| {
            ProtocolError::MalformedPacket(format!("unknown packet type {}", type_code))
        })?;

        let payload = &data[HEADER_LEN..];
        if data_size as usize != payload.len() {
            return Err(ProtocolError::MalformedPacket(format!(
                "data size {} does not match payload length {}",
                data_size,
                payload.len()
            )));
        }
        if packet_number == 0 || packet_number > total_packets {
            return Err(ProtocolError::MalformedPacket(format!(
                "fragment number {} out of range 1..={}",
                packet_number, total_packets
            )));
        }

        Ok(Packet {
            id,
            packet_type,
            total_packets,
            packet_number,
            payload: payload.to_vec(),
        })
    }
}

/// CRC-32/IEEE over the encoded packet with the checksum slot zeroed,
/// truncated to the low 16 bits.
fn wire_checksum(data: &[u8]) -> u16 {
    let mut digest = CRC32.digest();
    digest.update(&data[..CHECKSUM_OFFSET]);
    digest.update(&[0, 0]);
    digest.update(&data[CHECKSUM_OFFSET + 2..]);
    (digest.finalize() & 0xffff) as u16
}
