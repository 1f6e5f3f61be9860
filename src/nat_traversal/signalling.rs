/**
 * nat_traversal/signalling.rs
 *
 * Rendezvous wire protocol: one JSON message per UDP datagram
 */

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::{HolePunchError, Result};
use crate::nat_traversal::types::AddressPair;

/// Largest datagram either side will send or accept
pub const MAX_DATAGRAM_LEN: usize = 512;

/// Encoding and decoding failures
#[derive(Debug, Error)]
pub enum WireError {
    #[error("Message is {len} bytes, larger than the {max} byte datagram limit")]
    Oversized { len: usize, max: usize },

    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{kind} message is missing {field}")]
    MissingField { kind: &'static str, field: &'static str },
}

/// An address as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireAddress {
    pub address: String,
    pub port: u16,
}

impl WireAddress {
    /// Parse into a socket address, IPv4 or IPv6
    pub fn to_socket_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .address
            .parse()
            .map_err(|_| HolePunchError::InvalidAddress {
                address: self.address.clone(),
                port: self.port,
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for WireAddress {
    fn from(addr: SocketAddr) -> Self {
        Self {
            address: addr.ip().to_string(),
            port: addr.port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Register,
    Heartbeat,
    Connect,
    Hello,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Register,
    Heartbeat,
    Connect,
}

/// Client to server request. Hello is also exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<WireAddress>,
}

impl Request {
    pub fn register(local: SocketAddr) -> Self {
        Self {
            kind: RequestKind::Register,
            identifier: None,
            local_address: Some(local.into()),
        }
    }

    pub fn heartbeat(identifier: impl Into<String>, local: SocketAddr) -> Self {
        Self {
            kind: RequestKind::Heartbeat,
            identifier: Some(identifier.into()),
            local_address: Some(local.into()),
        }
    }

    pub fn connect(identifier: impl Into<String>, local: SocketAddr) -> Self {
        Self {
            kind: RequestKind::Connect,
            identifier: Some(identifier.into()),
            local_address: Some(local.into()),
        }
    }

    pub fn hello() -> Self {
        Self {
            kind: RequestKind::Hello,
            identifier: None,
            local_address: None,
        }
    }

    /// Check that every field the request type needs is present
    pub fn validate(&self) -> Result<(), WireError> {
        let kind = match self.kind {
            RequestKind::Register => "register",
            RequestKind::Heartbeat => "heartbeat",
            RequestKind::Connect => "connect",
            RequestKind::Hello => return Ok(()),
        };

        if self.kind != RequestKind::Register && self.identifier.is_none() {
            return Err(WireError::MissingField {
                kind,
                field: "identifier",
            });
        }
        if self.local_address.is_none() {
            return Err(WireError::MissingField {
                kind,
                field: "local_address",
            });
        }
        Ok(())
    }
}

/// Server to client response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hole_address: Option<WireAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_address: Option<WireAddress>,
}

impl Response {
    fn empty(kind: ResponseKind) -> Self {
        Self {
            kind,
            identifier: None,
            success: None,
            hole_address: None,
            local_address: None,
        }
    }

    pub fn registered(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::empty(ResponseKind::Register)
        }
    }

    pub fn heartbeat(success: bool) -> Self {
        Self {
            success: Some(success),
            ..Self::empty(ResponseKind::Heartbeat)
        }
    }

    /// Connect carrying a peer's address pair
    pub fn connect_to(peer: &AddressPair) -> Self {
        Self {
            hole_address: Some(peer.observed.into()),
            local_address: Some(peer.reported_local.into()),
            ..Self::empty(ResponseKind::Connect)
        }
    }

    /// Connect with no addresses: the identifier is unknown
    pub fn connect_not_found() -> Self {
        Self::empty(ResponseKind::Connect)
    }

    /// A missing success flag counts as success
    pub fn succeeded(&self) -> bool {
        self.success.unwrap_or(true)
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ResponseKind::Connect
            && self.hole_address.is_none()
            && self.local_address.is_none()
    }

    /// Check that every field the response type needs is present
    pub fn validate(&self) -> Result<(), WireError> {
        match self.kind {
            ResponseKind::Register if self.identifier.is_none() => Err(WireError::MissingField {
                kind: "register",
                field: "identifier",
            }),
            ResponseKind::Connect if self.hole_address.is_some() != self.local_address.is_some() => {
                let field = if self.hole_address.is_none() {
                    "hole_address"
                } else {
                    "local_address"
                };
                Err(WireError::MissingField {
                    kind: "connect",
                    field,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Everything that travels in one datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Packet {
    Request(Request),
    Response(Response),
}

impl Packet {
    pub fn validate(&self) -> Result<(), WireError> {
        match self {
            Packet::Request(request) => request.validate(),
            Packet::Response(response) => response.validate(),
        }
    }

    pub fn is_hello(&self) -> bool {
        matches!(self, Packet::Request(r) if r.kind == RequestKind::Hello)
    }
}

impl From<Request> for Packet {
    fn from(request: Request) -> Self {
        Packet::Request(request)
    }
}

impl From<Response> for Packet {
    fn from(response: Response) -> Self {
        Packet::Response(response)
    }
}

/// Serialize a packet, refusing anything that does not fit one datagram
pub fn encode(packet: &Packet) -> Result<Vec<u8>, WireError> {
    packet.validate()?;

    let bytes = serde_json::to_vec(packet)?;
    if bytes.len() > MAX_DATAGRAM_LEN {
        return Err(WireError::Oversized {
            len: bytes.len(),
            max: MAX_DATAGRAM_LEN,
        });
    }
    Ok(bytes)
}

/// Parse and validate one datagram
pub fn decode(data: &[u8]) -> Result<Packet, WireError> {
    if data.len() > MAX_DATAGRAM_LEN {
        return Err(WireError::Oversized {
            len: data.len(),
            max: MAX_DATAGRAM_LEN,
        });
    }

    let packet: Packet = serde_json::from_slice(data)?;
    packet.validate()?;
    Ok(packet)
}

/// Send one packet as a single datagram
pub async fn send_packet(socket: &UdpSocket, packet: &Packet, to: SocketAddr) -> Result<()> {
    let bytes = encode(packet)?;
    let sent = socket.send_to(&bytes, to).await?;

    if sent != bytes.len() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("sent {} of {} bytes to {}", sent, bytes.len(), to),
        )
        .into());
    }

    trace!(%to, len = bytes.len(), "sent {:?}", packet);
    Ok(())
}

/// Receive the next well formed packet, or `None` once `deadline` passes.
/// Undecodable datagrams are logged and skipped.
pub async fn recv_packet(socket: &UdpSocket, deadline: Instant) -> Result<Option<(Packet, SocketAddr)>> {
    // One spare byte so oversized datagrams are detected instead of truncated
    let mut buffer = [0u8; MAX_DATAGRAM_LEN + 1];

    loop {
        let (len, from) = match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Ok(Ok(received)) => received,
            // ICMP unreachable from an earlier send, keep waiting
            Ok(Err(e)) if is_transient(&e) => {
                debug!("Ignoring receive error: {}", e);
                continue;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(None),
        };

        match decode(&buffer[..len]) {
            Ok(packet) => {
                trace!(%from, len, "received {:?}", packet);
                return Ok(Some((packet, from)));
            }
            Err(e) => {
                warn!(%from, "Dropping datagram: {}", e);
            }
        }
    }
}

fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}
