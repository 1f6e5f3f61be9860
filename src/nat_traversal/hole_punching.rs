/**
 * nat_traversal/hole_punching.rs
 *
 * UDP hole punching with Hello datagrams
 */

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::nat_traversal::signalling::{recv_packet, send_packet, Packet, Request};

/// Send a Hello to `target` and wait up to `interval` for the peer's Hello.
///
/// Only a datagram whose source is exactly `target` counts. When it arrives
/// one more Hello is sent back so the peer sees us too. Returns `false` on
/// timeout, or when the peer answered with something other than Hello.
pub async fn punch_hole(socket: &UdpSocket, target: SocketAddr, interval: Duration) -> Result<bool> {
    let hello: Packet = Request::hello().into();
    send_packet(socket, &hello, target).await?;

    let deadline = Instant::now() + interval;

    while let Some((packet, from)) = recv_packet(socket, deadline).await? {
        if from != target {
            debug!(%from, %target, "Received datagram from address that doesn't match peer. Ignoring.");
            continue;
        }

        if !packet.is_hello() {
            warn!(%from, "Got something besides a peer Hello: {:?}", packet);
            return Ok(false);
        }

        send_packet(socket, &hello, target).await?;
        info!(peer = %target, "Hello exchanged");
        return Ok(true);
    }

    debug!(%target, "no Hello within {:?}", interval);
    Ok(false)
}
