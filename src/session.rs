//! Per-peer protocol state and the endpoint-keyed session registry.
//!
//! A session owns its reassembly buffer and reliability manager behind
//! their own locks; the registry hands out `Arc<Session>` so callers never
//! hold the registry lock while touching session internals. Sessions idle
//! longer than the session timeout are destroyed together with their
//! in-flight reassemblies and tracked packets.

use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::reassembly::ReassemblyBuffer;
use crate::reliability::ReliabilityManager;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Session {
    pub remote_addr: SocketAddr,
    pub reassembly: Mutex<ReassemblyBuffer>,
    pub reliability: Mutex<ReliabilityManager>,
    last_activity: std::sync::Mutex<Instant>,
    started_at: Instant,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    /// Most recently completed request id and the response payload it
    /// produced. A retransmitted request with this id is answered from
    /// here instead of re-running the command.
    last_completed: std::sync::Mutex<Option<(u32, Vec<u8>)>>,
}

impl Session {
    fn new(
        remote_addr: SocketAddr,
        ack_timeout: Duration,
        max_retries: u32,
        reassembly_timeout: Duration,
    ) -> Session {
        Session {
            remote_addr,
            reassembly: Mutex::new(ReassemblyBuffer::new(reassembly_timeout)),
            reliability: Mutex::new(ReliabilityManager::new(ack_timeout, max_retries)),
            last_activity: std::sync::Mutex::new(Instant::now()),
            started_at: Instant::now(),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            last_completed: std::sync::Mutex::new(None),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock().expect("last_activity lock") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity lock")
            .elapsed()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn record_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn cached_response(&self, id: u32) -> Option<Vec<u8>> {
        match &*self.last_completed.lock().expect("last_completed lock") {
            Some((cached_id, payload)) if *cached_id == id => Some(payload.clone()),
            _ => None,
        }
    }

    pub fn cache_response(&self, id: u32, payload: Vec<u8>) {
        *self.last_completed.lock().expect("last_completed lock") = Some((id, payload));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub packets_received: u64,
    pub packets_sent: u64,
}

pub struct SessionManager {
    sessions: RwLock<FxHashMap<String, Arc<Session>>>,
    session_timeout: Duration,
    ack_timeout: Duration,
    max_retries: u32,
    reassembly_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        session_timeout: Duration,
        ack_timeout: Duration,
        max_retries: u32,
        reassembly_timeout: Duration,
    ) -> SessionManager {
        SessionManager {
            sessions: RwLock::new(FxHashMap::default()),
            session_timeout,
            ack_timeout,
            max_retries,
            reassembly_timeout,
        }
    }

    /// Existing session for the endpoint (with its activity refreshed), or
    /// a freshly constructed one.
    pub async fn get_or_create(&self, remote_addr: SocketAddr) -> Arc<Session> {
        let key = remote_addr.to_string();

        let existing = self.sessions.read().await.get(&key).cloned();
        if let Some(session) = existing {
            session.touch();
            return session;
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(key.clone())
            .or_insert_with(|| {
                info!(remote = %key, "new client session");
                Arc::new(Session::new(
                    remote_addr,
                    self.ack_timeout,
                    self.max_retries,
                    self.reassembly_timeout,
                ))
            })
            .clone();
        drop(sessions);

        session.touch();
        session
    }

    /// Remove sessions idle longer than the session timeout and run the
    /// periodic buffer sweeps on the survivors. Returns the number of
    /// sessions removed.
    pub async fn sweep(&self) -> usize {
        let snapshot: Vec<(String, Arc<Session>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(key, session)| (key.clone(), session.clone()))
            .collect();

        let mut expired = Vec::new();
        for (key, session) in &snapshot {
            if session.idle_for() > self.session_timeout {
                expired.push(key.clone());
            } else {
                session.reassembly.lock().await.cleanup();
                session.reliability.lock().await.cleanup_old();
            }
        }

        if expired.is_empty() {
            return 0;
        }
        let mut sessions = self.sessions.write().await;
        let mut removed = 0;
        for key in &expired {
            if sessions.remove(key).is_some() {
                info!(remote = %key, "client session expired");
                removed += 1;
            }
        }
        removed
    }

    pub async fn stats(&self) -> SessionStats {
        let snapshot: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();

        let mut stats = SessionStats {
            total_sessions: snapshot.len(),
            ..SessionStats::default()
        };
        for session in snapshot {
            if session.idle_for() <= self.session_timeout {
                stats.active_sessions += 1;
            }
            stats.packets_received += session.packets_received();
            stats.packets_sent += session.packets_sent();
        }
        stats
    }

    /// Snapshot of all live sessions, for the retransmission tick.
    pub async fn all(&self) -> Vec<Arc<Session>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn debug_log_health(&self) {
        for session in self.all().await {
            let reliability = session.reliability.lock().await;
            debug!(
                remote = %session.remote_addr,
                healthy = reliability.is_healthy(),
                metrics = %reliability.metrics(),
                "session health"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, PacketType};
    use crate::reassembly::DEFAULT_REASSEMBLY_TIMEOUT;
    use crate::reliability::{DEFAULT_ACK_TIMEOUT, DEFAULT_MAX_RETRIES};

    fn manager() -> SessionManager {
        SessionManager::new(
            DEFAULT_SESSION_TIMEOUT,
            DEFAULT_ACK_TIMEOUT,
            DEFAULT_MAX_RETRIES,
            DEFAULT_REASSEMBLY_TIMEOUT,
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_get_or_create_returns_the_same_session() {
        let mgr = manager();
        let a = mgr.get_or_create(addr(1000)).await;
        let b = mgr.get_or_create(addr(1000)).await;
        let c = mgr.get_or_create(addr(2000)).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(mgr.stats().await.total_sessions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire_and_traffic_recreates_them() {
        let mgr = manager();
        let old = mgr.get_or_create(addr(1000)).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(mgr.sweep().await, 1);
        assert_eq!(mgr.stats().await.total_sessions, 0);

        // traffic from the same endpoint starts from scratch
        let fresh = mgr.get_or_create(addr(1000)).await;
        assert!(!Arc::ptr_eq(&old, &fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_keeps_a_session_alive() {
        let mgr = manager();
        mgr.get_or_create(addr(1000)).await;

        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(20)).await;
            mgr.get_or_create(addr(1000)).await;
        }
        assert_eq!(mgr.sweep().await, 0);
        assert_eq!(mgr.stats().await.active_sessions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_discards_in_flight_state() {
        let mgr = manager();
        let session = mgr.get_or_create(addr(1000)).await;

        let fragments =
            crate::fragment::fragment(5, PacketType::Request, &[1u8; 1200], 512);
        session.reassembly.lock().await.add(&fragments[0]).unwrap();
        session
            .reliability
            .lock()
            .await
            .track_sent(&Packet::new(9, PacketType::Response, Vec::new()));
        drop(session);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(mgr.sweep().await, 1);

        let fresh = mgr.get_or_create(addr(1000)).await;
        assert_eq!(fresh.reassembly.lock().await.pending(), 0);
        assert_eq!(fresh.reliability.lock().await.pending_acks(), 0);
    }

    #[tokio::test]
    async fn test_stats_aggregate_counters() {
        let mgr = manager();
        let a = mgr.get_or_create(addr(1000)).await;
        let b = mgr.get_or_create(addr(2000)).await;

        a.record_received();
        a.record_received();
        a.record_sent();
        b.record_received();

        let stats = mgr.stats().await;
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 2);
        assert_eq!(stats.packets_received, 3);
        assert_eq!(stats.packets_sent, 1);
    }

    #[tokio::test]
    async fn test_cached_response_matches_by_id_only() {
        let mgr = manager();
        let session = mgr.get_or_create(addr(1000)).await;

        assert_eq!(session.cached_response(7), None);
        session.cache_response(7, b"201 Term inserted: golang".to_vec());
        assert_eq!(
            session.cached_response(7),
            Some(b"201 Term inserted: golang".to_vec())
        );
        assert_eq!(session.cached_response(8), None);

        // a later completion displaces the entry
        session.cache_response(8, b"200 golang".to_vec());
        assert_eq!(session.cached_response(7), None);
    }
}
