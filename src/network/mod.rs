//! Network module - Handles peer links over the Bitcoin wire protocol
//!
//! Provides:
//! - Transports for byte streams and message-oriented channels
//! - Message assembly from chunked input
//! - Connection management, keepalive replies and message delivery

mod assembler;
mod connection;
mod responder;
mod transport;
mod waiters;

pub use assembler::*;
pub use connection::*;
pub use responder::*;
pub use transport::*;
pub use waiters::*;

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::protocol::MAX_MESSAGE_SIZE;

/// Configuration for a single connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Maximum payload size; never above the network's own ceiling
    pub max_message_size: usize,
    /// Reject pending waiters with `Closed` when the peer ends the link
    pub reject_waiters_on_end: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            max_message_size: MAX_MESSAGE_SIZE,
            reject_waiters_on_end: false,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn rejecting_waiters_on_end(mut self) -> Self {
        self.reject_waiters_on_end = true;
        self
    }
}

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}

/// Resolve `host` or `host:port`, falling back to `default_port`
pub async fn resolve_peer(peer: &str, default_port: u16) -> std::io::Result<SocketAddr> {
    if let Ok(addr) = peer.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let bare = peer.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    match peer.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse::<u16>() {
            Ok(port) => resolve_host(host, port).await,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid port in {}", peer),
            )),
        },
        _ => resolve_host(peer, default_port).await,
    }
}
