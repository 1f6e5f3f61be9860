/**
 * nat_traversal/mod.rs
 *
 * Client side of NAT traversal:
 * - Rendezvous wire protocol
 * - Endpoint with local address discovery
 * - UDP hole punching
 * - Sender and receiver state machines
 */

mod endpoint;
mod hole_punching;
mod receiver;
mod sender;
mod signalling;
mod types;

pub use endpoint::Endpoint;
pub use hole_punching::punch_hole;
pub use receiver::{receiver_machine, Receiver, ReceiverDelegate, ReceiverEvent, ReceiverState};
pub use sender::{sender_machine, Sender, SenderDelegate, SenderEvent, SenderState};
pub use signalling::{
    decode, encode, recv_packet, send_packet, Packet, Request, RequestKind, Response, ResponseKind,
    WireAddress, WireError, MAX_DATAGRAM_LEN,
};
pub use types::{AddressPair, ClientConfig, PeerRoute, DEFAULT_REMOTE_RETRIES, DEFAULT_RETRY_INTERVAL};
