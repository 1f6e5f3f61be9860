/**
 * rendezvous/server.rs
 *
 * Rendezvous server: one UDP socket, one request at a time
 */

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::nat_traversal::{
    decode, send_packet, AddressPair, Packet, Request, RequestKind, Response, MAX_DATAGRAM_LEN,
};
use crate::rendezvous::registry::Registry;

/// Default UDP port of the rendezvous server
pub const DEFAULT_PORT: u16 = 7560;

/// Rendezvous server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the UDP socket to
    pub bind_addr: SocketAddr,

    /// Evict registrations not refreshed for this long. `None` keeps them forever.
    pub registration_ttl: Option<Duration>,
}

impl ServerConfig {
    /// Listen on all IPv4 interfaces at `port`, no expiry
    pub fn new(port: u16) -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            registration_ttl: None,
        }
    }

    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_registration_ttl(mut self, ttl: Duration) -> Self {
        self.registration_ttl = Some(ttl);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PORT)
    }
}

/// Matchmaking server mapping identifiers to address pairs
pub struct RendezvousServer {
    socket: UdpSocket,
    registry: Registry,
    config: ServerConfig,
}

impl RendezvousServer {
    /// Bind the server socket
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let socket = Socket::new(
            Domain::for_address(config.bind_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&config.bind_addr.into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        info!("Rendezvous server listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            registry: Registry::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Apply one request from `source` to the table and return the datagrams
    /// to send, in order. Connect to a known identifier yields two: the reply
    /// to the requester and the notification to the registered sender.
    pub fn handle_request(&mut self, request: Request, source: SocketAddr) -> Vec<(Response, SocketAddr)> {
        match request.kind {
            RequestKind::Register => {
                let Some(addresses) = Self::address_pair(&request, source) else {
                    return Vec::new();
                };
                let identifier = self.registry.register(addresses);
                info!(%identifier, %source, "registered");
                vec![(Response::registered(identifier), source)]
            }

            RequestKind::Heartbeat => {
                let Some(identifier) = request.identifier.as_deref() else {
                    warn!(%source, "Heartbeat request missing identifier");
                    return Vec::new();
                };
                let Some(addresses) = Self::address_pair(&request, source) else {
                    return Vec::new();
                };

                if self.registry.heartbeat(identifier, addresses) {
                    debug!(%identifier, port = source.port(), "Updating identifier");
                    vec![(Response::heartbeat(true), source)]
                } else {
                    warn!(%identifier, "Couldn't find address for the given identifier for heartbeat");
                    vec![(Response::heartbeat(false), source)]
                }
            }

            RequestKind::Connect => {
                let Some(identifier) = request.identifier.as_deref() else {
                    warn!(%source, "Connect request missing identifier");
                    return Vec::new();
                };
                let Some(requester) = Self::address_pair(&request, source) else {
                    return Vec::new();
                };

                match self.registry.lookup(identifier) {
                    None => {
                        warn!(%identifier, "Couldn't find address for the given identifier");
                        vec![(Response::connect_not_found(), source)]
                    }
                    Some(target) => {
                        info!(%identifier, requester = %source, sender = %target.observed, "connecting peers");
                        vec![
                            (Response::connect_to(&target), source),
                            (Response::connect_to(&requester), target.observed),
                        ]
                    }
                }
            }

            // Hello is only meant for peers
            RequestKind::Hello => Vec::new(),
        }
    }

    /// Serve until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut buffer = [0u8; MAX_DATAGRAM_LEN + 1];
        let mut sweep = tokio::time::interval(self.sweep_period());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Rendezvous server shutting down");
                    return Ok(());
                }

                _ = sweep.tick() => {
                    self.evict_expired();
                }

                received = self.socket.recv_from(&mut buffer) => {
                    let (len, source) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            // ICMP errors from earlier sends surface here on some platforms
                            warn!("Error receiving datagram: {}", e);
                            continue;
                        }
                    };

                    let request = match decode(&buffer[..len]) {
                        Ok(Packet::Request(request)) => request,
                        Ok(Packet::Response(response)) => {
                            warn!(%source, "Ignoring {:?} response sent to the server", response.kind);
                            continue;
                        }
                        Err(e) => {
                            warn!(%source, "Error receiving message: {}", e);
                            continue;
                        }
                    };

                    for (response, to) in self.handle_request(request, source) {
                        if let Err(e) = send_packet(&self.socket, &response.into(), to).await {
                            error!(%to, "Error sending response: {}", e);
                        }
                    }
                }
            }
        }
    }

    fn sweep_period(&self) -> Duration {
        match self.config.registration_ttl {
            Some(ttl) => (ttl / 2).max(Duration::from_millis(10)),
            None => Duration::from_secs(3600),
        }
    }

    fn evict_expired(&mut self) {
        if let Some(ttl) = self.config.registration_ttl {
            let evicted = self.registry.evict_expired(ttl, Instant::now());
            if evicted > 0 {
                info!(evicted, remaining = self.registry.len(), "evicted stale registrations");
            }
        }
    }

    /// The sender's address as seen here, plus the local address it reported
    fn address_pair(request: &Request, source: SocketAddr) -> Option<AddressPair> {
        let local = request.local_address.as_ref()?;
        match local.to_socket_addr() {
            Ok(reported_local) => Some(AddressPair {
                observed: source,
                reported_local,
            }),
            Err(e) => {
                warn!(%source, "Error making socket address for peer: {}", e);
                None
            }
        }
    }
}

/// Bind and serve until Ctrl-C
pub async fn run_rendezvous_server(config: ServerConfig) -> Result<()> {
    let server = RendezvousServer::bind(config).await?;
    let cancel = CancellationToken::new();

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    server.run(cancel).await
}
