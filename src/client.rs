//! The client side: command round-trips, heartbeats and the periodic
//! exerciser.
//!
//! A command is fragmented under a fresh message id and sent with a small
//! gap between fragments. While the reply is awaited the client keeps its
//! own reliability manager ticking, so request fragments whose ACK never
//! arrived are retransmitted with the same backoff the server uses. Reply
//! fragments are CRC-checked and reassembled until they yield a payload of
//! the form `"<status> <message>"`.

use anyhow::{anyhow, bail};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ClientConfig, RECV_BUFFER_SIZE};
use crate::fragment;
use crate::packet::{Packet, PacketType};
use crate::reassembly::{ReassemblyBuffer, DEFAULT_REASSEMBLY_TIMEOUT};
use crate::reliability::ReliabilityManager;
use crate::send_pipeline::{SendPipeline, SendSocket};

/// How often the reply wait loop checks for due retransmissions.
const RETRANSMIT_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    ClientError,
    ServerError,
    Other,
}

impl StatusClass {
    pub fn of(status: u16) -> StatusClass {
        match status {
            200..=299 => StatusClass::Success,
            400..=499 => StatusClass::ClientError,
            500..=599 => StatusClass::ServerError,
            _ => StatusClass::Other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusClass::Success => "SUCCESS",
            StatusClass::ClientError => "CLIENT ERROR",
            StatusClass::ServerError => "SERVER ERROR",
            StatusClass::Other => "RESPONSE",
        }
    }
}

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub message: String,
}

impl Reply {
    pub fn class(&self) -> StatusClass {
        StatusClass::of(self.status)
    }
}

fn parse_reply(payload: &[u8]) -> anyhow::Result<Reply> {
    let text = std::str::from_utf8(payload)?;
    let (status, message) = text.split_once(' ').unwrap_or((text, ""));
    let status = status
        .parse()
        .map_err(|_| anyhow!("response has no status code: {:?}", text))?;
    Ok(Reply {
        status,
        message: message.to_string(),
    })
}

pub struct UdpClient {
    socket: Arc<UdpSocket>,
    pipeline: SendPipeline,
    server_addr: SocketAddr,
    config: ClientConfig,
    next_id: Arc<AtomicU32>,
}

impl UdpClient {
    /// Resolve the server address once and bind an ephemeral local socket.
    pub async fn connect(config: ClientConfig) -> anyhow::Result<UdpClient> {
        config.validate()?;
        let server_addr = lookup_host(config.server_addr())
            .await?
            .next()
            .ok_or_else(|| anyhow!("could not resolve {}", config.server_addr()))?;
        info!(%server_addr, "server address resolved");

        let bind_addr = if server_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let pipeline = SendPipeline::new(Arc::new(socket.clone()) as Arc<dyn SendSocket>);

        Ok(UdpClient {
            socket,
            pipeline,
            server_addr,
            config,
            next_id: Arc::new(AtomicU32::new(0)),
        })
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// One full command round-trip: fragment, send, retransmit as needed,
    /// reassemble the reply.
    pub async fn send_command(&self, command: &str) -> anyhow::Result<Reply> {
        let id = self.next_id();
        let fragments = fragment::fragment(
            id,
            PacketType::Request,
            command.as_bytes(),
            self.config.max_payload_size,
        );
        debug!(id, fragments = fragments.len(), "sending command");

        let mut reliability =
            ReliabilityManager::new(self.config.ack_timeout, self.config.max_retries);
        for (idx, packet) in fragments.iter().enumerate() {
            if idx > 0 {
                sleep(self.config.fragment_gap).await;
            }
            self.pipeline.send_packet(self.server_addr, packet).await;
            reliability.track_sent(packet);
        }

        let mut reassembly = ReassemblyBuffer::new(DEFAULT_REASSEMBLY_TIMEOUT);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let mut deadline = Instant::now() + self.config.response_timeout;

        loop {
            for packet in reliability.retransmit_candidates() {
                debug!(id = packet.id, number = packet.packet_number, "retransmitting request fragment");
                self.pipeline.send_packet(self.server_addr, &packet).await;
                reliability.track_sent(&packet);
            }

            let wake = deadline.min(Instant::now() + RETRANSMIT_POLL);
            let (len, from) = match timeout_at(wake, self.socket.recv_from(&mut buf)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    error!("socket error on receive: {}", e);
                    continue;
                }
                Err(_) if Instant::now() >= deadline => {
                    bail!(
                        "no response from {} within {:?}",
                        self.server_addr,
                        self.config.response_timeout
                    );
                }
                Err(_) => continue, // retransmission poll tick
            };

            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(%from, "dropping datagram: {}", e);
                    continue;
                }
            };
            deadline = Instant::now() + self.config.response_timeout;

            match packet.packet_type {
                PacketType::Ack => {
                    if !reliability.mark_ack(packet.id) {
                        debug!(id = packet.id, "ACK for an id this command did not send");
                    }
                }
                PacketType::Response if packet.id == id => {
                    match reassembly.add(&packet) {
                        Ok(Some(payload)) => return parse_reply(&payload),
                        Ok(None) => {}
                        Err(e) => warn!(%from, "dropping fragment: {}", e),
                    }
                }
                PacketType::Response => {
                    debug!(id = packet.id, "response for a different request - dropping");
                }
                other => trace!(%from, packet_type = %other, "ignoring packet"),
            }
        }
    }

    /// Periodic HEARTBEAT under the shared id counter; the server answers
    /// each beat with an ACK.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let server_addr = self.server_addr;
        let next_id = self.next_id.clone();
        let beat_interval = self.config.heartbeat_interval;

        tokio::spawn(async move {
            let mut tick = interval(beat_interval);
            tick.tick().await; // first beat one full interval from now
            loop {
                tick.tick().await;
                let id = next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
                trace!(id, "heartbeat");
                pipeline.send_packet(server_addr, &Packet::heartbeat(id)).await;
            }
        })
    }
}

/// Exercise the server on a fixed cadence, alternating LIST with a LOOKUP
/// of a random key from the last listing.
pub async fn run_exerciser(client: &UdpClient, cadence: Duration) -> anyhow::Result<()> {
    let mut tick = interval(cadence);
    let mut next_command = String::from("LIST");
    loop {
        tick.tick().await;
        let command = std::mem::replace(&mut next_command, String::from("LIST"));
        match client.send_command(&command).await {
            Ok(reply) => {
                info!(command = %command, status = reply.status, message = %reply.message, "reply");
                if let Some(lookup) = pick_lookup(&command, &reply) {
                    next_command = lookup;
                }
            }
            Err(e) => warn!(command = %command, "command failed: {:#}", e),
        }
    }
}

fn pick_lookup(command: &str, reply: &Reply) -> Option<String> {
    if command != "LIST" || reply.status != 200 || reply.message == "[empty]" {
        return None;
    }
    let keys: Vec<&str> = reply.message.split('\n').collect();
    let pick = keys[rand::thread_rng().gen_range(0..keys.len())];
    Some(format!("LOOKUP {}", pick))
}
