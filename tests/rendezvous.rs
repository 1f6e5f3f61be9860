/**
 * tests/rendezvous.rs
 *
 * Rendezvous server over loopback, driven with raw sockets
 */

use holepunch::nat_traversal::{decode, encode, Packet, Request, Response, ResponseKind};
use holepunch::rendezvous::{RendezvousServer, ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(2);

async fn start_server() -> (SocketAddr, CancellationToken) {
    let config = ServerConfig::new(0).with_bind_addr("127.0.0.1:0".parse().unwrap());
    let server = RendezvousServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();

    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));
    (addr, cancel)
}

async fn client() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn send(socket: &UdpSocket, request: Request, to: SocketAddr) {
    let bytes = encode(&Packet::Request(request)).unwrap();
    socket.send_to(&bytes, to).await.unwrap();
}

async fn recv(socket: &UdpSocket) -> (Response, SocketAddr) {
    let mut buffer = [0u8; 1024];
    let (len, from) = timeout(WAIT, socket.recv_from(&mut buffer))
        .await
        .expect("no datagram from server")
        .unwrap();
    match decode(&buffer[..len]).unwrap() {
        Packet::Response(response) => (response, from),
        other => panic!("expected a response, got {:?}", other),
    }
}

async fn register(socket: &UdpSocket, server: SocketAddr) -> String {
    send(socket, Request::register(socket.local_addr().unwrap()), server).await;
    let (response, from) = recv(socket).await;
    assert_eq!(from, server);
    assert_eq!(response.kind, ResponseKind::Register);
    response.identifier.unwrap()
}

#[tokio::test]
async fn register_then_connect_returns_sender_addresses() {
    let (server, cancel) = start_server().await;
    let sender = client().await;
    let receiver = client().await;

    let id = register(&sender, server).await;
    send(&receiver, Request::connect(id, receiver.local_addr().unwrap()), server).await;

    let (reply, _) = recv(&receiver).await;
    assert_eq!(reply.kind, ResponseKind::Connect);
    let hole = reply.hole_address.unwrap().to_socket_addr().unwrap();
    let local = reply.local_address.unwrap().to_socket_addr().unwrap();
    assert_eq!(hole, sender.local_addr().unwrap());
    assert_eq!(local, sender.local_addr().unwrap());

    // The sender is told about the receiver as well
    let (push, from) = recv(&sender).await;
    assert_eq!(from, server);
    assert_eq!(push.kind, ResponseKind::Connect);
    assert_eq!(
        push.hole_address.unwrap().to_socket_addr().unwrap(),
        receiver.local_addr().unwrap()
    );

    cancel.cancel();
}

#[tokio::test]
async fn heartbeat_from_new_port_replaces_observed_address() {
    let (server, cancel) = start_server().await;
    let first = client().await;
    let second = client().await;
    let receiver = client().await;

    let id = register(&first, server).await;

    send(&second, Request::heartbeat(id.clone(), second.local_addr().unwrap()), server).await;
    let (ack, _) = recv(&second).await;
    assert_eq!(ack.kind, ResponseKind::Heartbeat);
    assert!(ack.succeeded());

    send(&receiver, Request::connect(id, receiver.local_addr().unwrap()), server).await;
    let (reply, _) = recv(&receiver).await;
    assert_eq!(
        reply.hole_address.unwrap().to_socket_addr().unwrap(),
        second.local_addr().unwrap()
    );

    cancel.cancel();
}

#[tokio::test]
async fn unknown_identifier_is_rejected() {
    let (server, cancel) = start_server().await;
    let socket = client().await;
    let local = socket.local_addr().unwrap();

    send(&socket, Request::heartbeat("NO-SUCH-ID", local), server).await;
    let (response, _) = recv(&socket).await;
    assert_eq!(response.kind, ResponseKind::Heartbeat);
    assert_eq!(response.success, Some(false));

    send(&socket, Request::connect("NO-SUCH-ID", local), server).await;
    let (response, _) = recv(&socket).await;
    assert_eq!(response.kind, ResponseKind::Connect);
    assert!(response.is_not_found());

    cancel.cancel();
}

#[tokio::test]
async fn malformed_datagram_is_dropped_and_server_keeps_serving() {
    let (server, cancel) = start_server().await;
    let socket = client().await;

    socket.send_to(b"definitely not a request", server).await.unwrap();

    let mut buffer = [0u8; 1024];
    let silence = timeout(Duration::from_millis(200), socket.recv_from(&mut buffer)).await;
    assert!(silence.is_err());

    let id = register(&socket, server).await;
    assert!(!id.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn expired_registration_is_forgotten() {
    let config = ServerConfig::new(0)
        .with_bind_addr("127.0.0.1:0".parse().unwrap())
        .with_registration_ttl(Duration::from_millis(100));
    let server = RendezvousServer::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    let cancel = CancellationToken::new();
    tokio::spawn(server.run(cancel.clone()));

    let sender = client().await;
    let id = register(&sender, addr).await;

    tokio::time::sleep(Duration::from_millis(400)).await;

    let receiver = client().await;
    send(&receiver, Request::connect(id, receiver.local_addr().unwrap()), addr).await;
    let (reply, _) = recv(&receiver).await;
    assert!(reply.is_not_found());

    cancel.cancel();
}
