/**
 * nat_traversal/types.rs
 *
 * Core types for NAT traversal
 */

use std::net::SocketAddr;
use std::time::Duration;

/// Default wait before a request or handshake attempt is considered lost
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Default number of remote handshake attempts after the first one
pub const DEFAULT_REMOTE_RETRIES: u32 = 3;

/// The two addresses known for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressPair {
    /// Source address the rendezvous server saw (public side of the NAT)
    pub observed: SocketAddr,

    /// Address the peer reported for itself (usually its LAN address)
    pub reported_local: SocketAddr,
}

/// Which of the peer's addresses answered the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRoute {
    Local,
    Remote,
}

impl std::fmt::Display for PeerRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRoute::Local => write!(f, "local"),
            PeerRoute::Remote => write!(f, "remote"),
        }
    }
}

/// Client side configuration, shared by senders and receivers
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Rendezvous server address (ip:port)
    pub server_addr: SocketAddr,

    /// How long each request or handshake attempt waits for an answer
    pub retry_interval: Duration,

    /// Remote handshake attempts after the first one before giving up
    pub remote_retries: u32,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            remote_retries: DEFAULT_REMOTE_RETRIES,
        }
    }

    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn with_remote_retries(mut self, remote_retries: u32) -> Self {
        self.remote_retries = remote_retries;
        self
    }

    /// Total remote attempts on the retry ladder
    pub fn remote_attempts(&self) -> u32 {
        self.remote_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_length_follows_remote_retries() {
        let server: SocketAddr = "127.0.0.1:7560".parse().unwrap();

        let config = ClientConfig::new(server);
        assert_eq!(config.remote_attempts(), 4);
        assert_eq!(config.retry_interval, DEFAULT_RETRY_INTERVAL);

        let config = config
            .with_remote_retries(1)
            .with_retry_interval(Duration::from_millis(50));
        assert_eq!(config.remote_attempts(), 2);
        assert_eq!(config.retry_interval, Duration::from_millis(50));
    }

    #[test]
    fn route_prints_lower_case() {
        assert_eq!(PeerRoute::Local.to_string(), "local");
        assert_eq!(PeerRoute::Remote.to_string(), "remote");
    }
}
