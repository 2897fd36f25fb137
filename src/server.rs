//! The datagram server: receive loop, per-packet handlers and the periodic
//! workers driving retransmission and expiry.
//!
//! Every inbound REQUEST fragment is acknowledged immediately and fed to
//! the peer's reassembly buffer; a completed message runs through the
//! dispatcher and the response is fragmented, tracked for retransmission
//! and sent. ACKs themselves are never tracked (no ACK-of-ACKs). The
//! response produced for the most recently completed request id is kept per
//! session, so a retransmitted request is answered from that cache instead
//! of running the command again.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ServerConfig, RECV_BUFFER_SIZE};
use crate::dictionary::Dictionary;
use crate::dispatcher;
use crate::fragment;
use crate::packet::{Packet, PacketType};
use crate::send_pipeline::{SendPipeline, SendSocket};
use crate::session::{Session, SessionManager};

pub struct UdpServer {
    socket: Arc<UdpSocket>,
    pipeline: SendPipeline,
    sessions: Arc<SessionManager>,
    dictionary: Arc<RwLock<Dictionary>>,
    config: ServerConfig,
}

impl UdpServer {
    pub async fn bind(config: ServerConfig) -> anyhow::Result<UdpServer> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(config.bind_addr()).await?);
        info!(local_addr = %socket.local_addr()?, "UDP server listening");

        let pipeline = SendPipeline::new(Arc::new(socket.clone()) as Arc<dyn SendSocket>);
        Ok(UdpServer::new_with(socket, pipeline, config))
    }

    fn new_with(socket: Arc<UdpSocket>, pipeline: SendPipeline, config: ServerConfig) -> UdpServer {
        let sessions = Arc::new(SessionManager::new(
            config.session_timeout,
            config.ack_timeout,
            config.max_retries,
            config.reassembly_timeout,
        ));
        UdpServer {
            socket,
            pipeline,
            sessions,
            dictionary: Arc::new(RwLock::new(Dictionary::new())),
            config,
        }
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Run the receive loop forever, with the periodic workers alongside.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.spawn_workers();

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    error!("socket error on receive: {}", e);
                    continue;
                }
            };

            let data = buf[..len].to_vec();
            let server = self.clone();
            tokio::spawn(async move {
                server.accept(from, &data).await;
            });
        }
    }

    fn spawn_workers(self: &Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(server.config.sweep_interval);
            loop {
                tick.tick().await;
                let removed = server.sessions.sweep().await;
                if removed > 0 {
                    debug!(removed, "expired idle sessions");
                }
            }
        });

        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(server.config.retransmit_interval);
            loop {
                tick.tick().await;
                server.retransmit_pending().await;
            }
        });

        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = interval(server.config.stats_interval);
            loop {
                tick.tick().await;
                let stats = server.sessions.stats().await;
                info!(
                    active_sessions = stats.active_sessions,
                    total_sessions = stats.total_sessions,
                    packets_received = stats.packets_received,
                    packets_sent = stats.packets_sent,
                    "server statistics"
                );
                server.sessions.debug_log_health().await;
            }
        });
    }

    /// Resolve the peer's session and handle one raw datagram.
    async fn accept(&self, from: SocketAddr, data: &[u8]) {
        let session = self.sessions.get_or_create(from).await;
        session.record_received();
        self.handle_packet(from, &session, data).await;
    }

    async fn handle_packet(&self, from: SocketAddr, session: &Arc<Session>, data: &[u8]) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(%from, "dropping datagram: {}", e);
                return;
            }
        };
        trace!(%from, packet = ?packet, "packet received");

        match packet.packet_type {
            PacketType::Request => self.handle_request(from, session, packet).await,
            PacketType::Ack => {
                if !session.reliability.lock().await.mark_ack(packet.id) {
                    warn!(%from, id = packet.id, "ACK for unknown packet id");
                }
            }
            PacketType::Heartbeat => {
                debug!(%from, id = packet.id, "heartbeat");
                // acknowledged but, like all ACKs, never tracked
                self.pipeline.send_packet(from, &Packet::ack(packet.id)).await;
            }
            PacketType::Response => {
                warn!(%from, id = packet.id, "unexpected RESPONSE packet - dropping");
            }
        }
    }

    async fn handle_request(&self, from: SocketAddr, session: &Arc<Session>, packet: Packet) {
        let id = packet.id;
        self.pipeline.send_packet(from, &Packet::ack(id)).await;

        if let Some(cached) = session.cached_response(id) {
            debug!(%from, id, "duplicate request - re-sending cached response");
            self.send_response(from, session, id, cached).await;
            return;
        }

        let assembled = match session.reassembly.lock().await.add(&packet) {
            Ok(assembled) => assembled,
            Err(e) => {
                warn!(%from, "dropping fragment: {}", e);
                return;
            }
        };
        let Some(payload) = assembled else {
            trace!(%from, id, "message incomplete, waiting for more fragments");
            return;
        };

        let response = dispatcher::dispatch(&payload, &self.dictionary).await;
        info!(%from, id, status = response.status, "command processed");

        // serialised and fragmented outside the dictionary lock
        let response_payload = response.render().into_bytes();
        session.cache_response(id, response_payload.clone());
        self.send_response(from, session, id, response_payload).await;
    }

    async fn send_response(
        &self,
        to: SocketAddr,
        session: &Arc<Session>,
        id: u32,
        payload: Vec<u8>,
    ) {
        let fragments = fragment::fragment(
            id,
            PacketType::Response,
            &payload,
            self.config.max_payload_size,
        );
        for packet in fragments {
            self.send_tracked(to, session, &packet).await;
        }
    }

    async fn send_tracked(&self, to: SocketAddr, session: &Arc<Session>, packet: &Packet) {
        self.pipeline.send_packet(to, packet).await;
        session.reliability.lock().await.track_sent(packet);
        session.record_sent();
    }

    /// One retransmission tick: ask every session for due packets and
    /// resend them. Candidate collection drops the reliability lock before
    /// any socket write.
    pub async fn retransmit_pending(&self) {
        for session in self.sessions.all().await {
            let candidates = session.reliability.lock().await.retransmit_candidates();
            if candidates.is_empty() {
                continue;
            }
            debug!(remote = %session.remote_addr, count = candidates.len(), "retransmitting");
            for packet in candidates {
                self.send_tracked(session.remote_addr, &session, &packet).await;
            }
        }
    }
}
