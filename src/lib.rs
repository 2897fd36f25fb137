//! A shared in-memory dictionary service on top of a hand-rolled reliable
//! datagram protocol.
//!
//! ## Protocol
//!
//! The transport layers three concerns over plain UDP:
//! * **Fragmentation / reassembly** - a logical message (a text command or
//!   its reply) is split into fragments of at most the configured payload
//!   size, each tagged with `(id, packet_number, total_packets)`. Fragments
//!   may arrive in any order and duplicated; the receiver buffers them per
//!   message id and assembles the payload once every number 1..=N is
//!   present. Partial messages expire after 5 s without a new fragment.
//! * **Per-packet integrity** - every datagram carries the low 16 bits of a
//!   CRC-32/IEEE over the encoded packet (checksum slot zeroed). Corrupt
//!   datagrams are dropped silently; there is no NAK.
//! * **Acknowledgement-driven retransmission** - REQUEST and HEARTBEAT
//!   packets are acknowledged with a zero-payload ACK bearing the same id.
//!   Senders track outstanding packets and retransmit with a linear
//!   backoff (`ack_timeout * (retries + 1)`) up to `max_retries` times;
//!   after that the packet is abandoned and the peer runs into its own
//!   read deadline.
//!
//! There is deliberately no ordering guarantee across independent messages,
//!  no flow or congestion control beyond the per-packet timeout, and no
//!  connection handshake - per-peer state is created on first contact and
//!  expires after 30 s of silence.
//!
//! ## Service
//!
//! The payload of a completed REQUEST is a text command (`LIST`,
//! `LOOKUP <term>`, `INSERT <term> <definition...>`,
//! `UPDATE <term> <definition...>`) run against a single ordered
//! term -> definition dictionary under a read-write lock; the reply payload
//! is `"<status> <message>"` with HTTP-flavoured status codes. Command
//! execution is the only thing that happens under the dictionary lock -
//! responses are serialised and fragmented after it is released.

pub mod client;
pub mod config;
pub mod dictionary;
pub mod dispatcher;
pub mod error;
pub mod fragment;
pub mod packet;
pub mod reassembly;
pub mod reliability;
pub mod send_pipeline;
pub mod server;
pub mod session;

#[cfg(test)]
mod tests {
    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .try_init()
            .ok();
    }
}
