//! Server and client configuration with protocol defaults.

use anyhow::bail;
use std::time::Duration;

use crate::packet::{DEFAULT_MAX_PAYLOAD, HEADER_LEN};
use crate::reassembly::DEFAULT_REASSEMBLY_TIMEOUT;
use crate::reliability::{DEFAULT_ACK_TIMEOUT, DEFAULT_MAX_RETRIES};
use crate::session::DEFAULT_SESSION_TIMEOUT;

pub const DEFAULT_PORT: u16 = 8080;

/// Receive buffers must accommodate a full header plus the largest payload.
pub const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Clone)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
    pub max_payload_size: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    pub reassembly_timeout: Duration,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub retransmit_interval: Duration,
    pub stats_interval: Duration,
}

impl ServerConfig {
    pub fn new(address: String, port: u16) -> ServerConfig {
        ServerConfig {
            address,
            port,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            sweep_interval: Duration::from_secs(10),
            retransmit_interval: Duration::from_secs(1),
            stats_interval: Duration::from_secs(30),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_size == 0 {
            bail!("max payload size must be positive");
        }
        if HEADER_LEN + self.max_payload_size > RECV_BUFFER_SIZE {
            bail!(
                "max payload size {} does not fit the {} byte receive buffer",
                self.max_payload_size,
                RECV_BUFFER_SIZE
            );
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub address: String,
    pub port: u16,
    pub max_payload_size: usize,
    pub ack_timeout: Duration,
    pub max_retries: u32,
    /// Pause between fragments of one request; a rate gap to reduce burst
    /// loss on loopback and lossy links.
    pub fragment_gap: Duration,
    /// Read deadline while waiting for a response datagram.
    pub response_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl ClientConfig {
    pub fn new(address: String, port: u16) -> ClientConfig {
        ClientConfig {
            address,
            port,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            fragment_gap: Duration::from_millis(10),
            response_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_size == 0 {
            bail!("max payload size must be positive");
        }
        if self.response_timeout.is_zero() {
            bail!("response timeout must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(ServerConfig::new("localhost".into(), DEFAULT_PORT)
            .validate()
            .is_ok());
        assert!(ClientConfig::new("localhost".into(), DEFAULT_PORT)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let mut config = ServerConfig::new("localhost".into(), DEFAULT_PORT);
        config.max_payload_size = RECV_BUFFER_SIZE;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_payload_is_rejected() {
        let mut config = ServerConfig::new("localhost".into(), DEFAULT_PORT);
        config.max_payload_size = 0;
        assert!(config.validate().is_err());
    }
}
