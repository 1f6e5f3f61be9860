/**
 * nat_traversal/endpoint.rs
 *
 * One peer's UDP socket plus everything it knows about addresses
 */

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{HolePunchError, Result};
use crate::nat_traversal::hole_punching::punch_hole;
use crate::nat_traversal::signalling::{recv_packet, send_packet, Packet, Request, Response};
use crate::nat_traversal::types::PeerRoute;

/// A peer's socket, the server it talks to, and the addresses learned so far
#[derive(Debug)]
pub struct Endpoint {
    socket: UdpSocket,
    server_addr: SocketAddr,
    local_addr: SocketAddr,
    peer_addr: Option<SocketAddr>,
    peer_local_addr: Option<SocketAddr>,
    route: Option<PeerRoute>,
}

impl Endpoint {
    /// Open a socket for talking to `server_addr`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn open(server_addr: SocketAddr) -> Result<Self> {
        let local_ip = discover_local_ip(server_addr)?;

        let unspecified = match server_addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let socket = Socket::new(
            Domain::for_address(server_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.bind(&SocketAddr::new(unspecified, 0).into())?;
        socket.set_nonblocking(true)?;

        let socket = UdpSocket::from_std(socket.into())?;
        let port = socket.local_addr()?.port();
        let local_addr = SocketAddr::new(local_ip, port);

        debug!(%server_addr, %local_addr, "endpoint opened");

        Ok(Self {
            socket,
            server_addr,
            local_addr,
            peer_addr: None,
            peer_local_addr: None,
            route: None,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// The address this endpoint reports for itself
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn has_peer_address(&self) -> bool {
        self.peer_addr.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.route.is_some()
    }

    pub fn connected_locally(&self) -> bool {
        self.route == Some(PeerRoute::Local)
    }

    pub fn route(&self) -> Option<PeerRoute> {
        self.route
    }

    /// The peer address in use: the local one if the handshake succeeded
    /// locally, the observed one otherwise.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        match self.route {
            Some(PeerRoute::Local) => self.peer_local_addr,
            _ => self.peer_addr,
        }
    }

    /// Take the peer's address pair from a Connect response.
    ///
    /// A field that fails to parse is cleared and the call fails; the caller
    /// treats that like a timeout.
    pub fn update_peer_addresses(&mut self, response: &Response) -> Result<()> {
        let observed = response
            .hole_address
            .as_ref()
            .ok_or(HolePunchError::NoPeerAddress)
            .and_then(|hole| hole.to_socket_addr());
        match observed {
            Ok(addr) => self.peer_addr = Some(addr),
            Err(e) => {
                warn!("Couldn't use peer address: {}. Treating like a timeout.", e);
                self.peer_addr = None;
                return Err(e);
            }
        }

        let local = response
            .local_address
            .as_ref()
            .ok_or(HolePunchError::NoPeerAddress)
            .and_then(|local| local.to_socket_addr());
        match local {
            Ok(addr) => self.peer_local_addr = Some(addr),
            Err(e) => {
                warn!("Couldn't use peer local address: {}. Treating like a timeout.", e);
                self.peer_local_addr = None;
                return Err(e);
            }
        }

        debug!(
            peer = ?self.peer_addr,
            peer_local = ?self.peer_local_addr,
            "learned peer addresses"
        );
        Ok(())
    }

    /// Hand the socket to the caller. Only valid once connected.
    pub fn into_socket(self) -> Result<UdpSocket> {
        if !self.is_connected() {
            return Err(HolePunchError::NotConnected);
        }
        Ok(self.socket)
    }

    pub(crate) async fn send_to_server(&self, request: Request) -> Result<()> {
        send_packet(&self.socket, &request.into(), self.server_addr).await
    }

    /// Wait for a response that really comes from the server.
    /// Datagrams from anywhere else are skipped.
    pub(crate) async fn recv_from_server(&self, deadline: Instant) -> Result<Option<Response>> {
        while let Some((packet, from)) = recv_packet(&self.socket, deadline).await? {
            if from != self.server_addr {
                debug!(%from, "Received datagram from address that doesn't match server. Ignoring.");
                continue;
            }

            match packet {
                Packet::Response(response) => return Ok(Some(response)),
                Packet::Request(request) => {
                    warn!("Server sent a {:?} request. Ignoring.", request.kind);
                }
            }
        }
        Ok(None)
    }

    /// One Hello exchange with the peer's local address
    pub(crate) async fn connect_local(&mut self, interval: std::time::Duration) -> Result<bool> {
        let target = self.peer_local_addr.ok_or(HolePunchError::NoPeerAddress)?;
        self.connect_via(target, PeerRoute::Local, interval).await
    }

    /// One Hello exchange with the peer's observed address
    pub(crate) async fn connect_remote(&mut self, interval: std::time::Duration) -> Result<bool> {
        let target = self.peer_addr.ok_or(HolePunchError::NoPeerAddress)?;
        self.connect_via(target, PeerRoute::Remote, interval).await
    }

    async fn connect_via(
        &mut self,
        target: SocketAddr,
        route: PeerRoute,
        interval: std::time::Duration,
    ) -> Result<bool> {
        let answered = punch_hole(&self.socket, target, interval).await?;
        if answered {
            self.route = Some(route);
        }
        Ok(answered)
    }
}

/// Learn which local interface routes toward `server_addr`.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick a source
/// address, which `getsockname` then reports.
fn discover_local_ip(server_addr: SocketAddr) -> Result<IpAddr> {
    let probe = Socket::new(
        Domain::for_address(server_addr),
        Type::DGRAM,
        Some(Protocol::UDP),
    )?;
    probe.connect(&server_addr.into())?;

    let local = probe
        .local_addr()?
        .as_socket()
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "Local address is not an IP address")
        })?;
    Ok(local.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nat_traversal::signalling::WireAddress;
    use crate::nat_traversal::types::AddressPair;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn open_reports_routable_local_address() {
        let endpoint = Endpoint::open(addr("127.0.0.1:9")).unwrap();

        assert_eq!(endpoint.server_addr(), addr("127.0.0.1:9"));
        assert_eq!(endpoint.local_addr().ip(), addr("127.0.0.1:9").ip());
        assert_ne!(endpoint.local_addr().port(), 0);
        assert!(!endpoint.has_peer_address());
        assert!(!endpoint.is_connected());
        assert_eq!(endpoint.peer_address(), None);
    }

    #[tokio::test]
    async fn update_peer_addresses_from_connect() {
        let mut endpoint = Endpoint::open(addr("127.0.0.1:9")).unwrap();
        let pair = AddressPair {
            observed: addr("198.51.100.7:40000"),
            reported_local: addr("192.168.1.20:5000"),
        };

        endpoint.update_peer_addresses(&Response::connect_to(&pair)).unwrap();

        assert!(endpoint.has_peer_address());
        assert!(!endpoint.connected_locally());
        assert_eq!(endpoint.peer_address(), Some(pair.observed));
    }

    #[tokio::test]
    async fn unparseable_address_clears_field() {
        let mut endpoint = Endpoint::open(addr("127.0.0.1:9")).unwrap();
        let mut response = Response::connect_to(&AddressPair {
            observed: addr("198.51.100.7:40000"),
            reported_local: addr("192.168.1.20:5000"),
        });
        response.hole_address = Some(WireAddress {
            address: "999.1.1.1".into(),
            port: 1,
        });

        assert!(endpoint.update_peer_addresses(&response).is_err());
        assert!(!endpoint.has_peer_address());

        assert!(endpoint
            .update_peer_addresses(&Response::connect_not_found())
            .is_err());
    }

    #[tokio::test]
    async fn socket_stays_until_connected() {
        let endpoint = Endpoint::open(addr("127.0.0.1:9")).unwrap();
        assert!(matches!(endpoint.into_socket(), Err(HolePunchError::NotConnected)));
    }
}
