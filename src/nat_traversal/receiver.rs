/**
 * nat_traversal/receiver.rs
 *
 * Receiver side: look up a sender by identifier and punch through to it
 */

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{HolePunchError, Result};
use crate::fsm::{Automaton, Next, StateMachine};
use crate::nat_traversal::endpoint::Endpoint;
use crate::nat_traversal::signalling::{Request, ResponseKind};
use crate::nat_traversal::types::{ClientConfig, PeerRoute};

/// Notified when the server does not know the requested identifier
pub trait ReceiverDelegate: Send + Sync {
    fn invalid_id(&self);
}

impl<F> ReceiverDelegate for F
where
    F: Fn() + Send + Sync,
{
    fn invalid_id(&self) {
        self()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverState {
    LookupAddress,
    LocalConnect,
    RemoteConnect,
    Connected,
    InvalidId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverEvent {
    Timeout,
    GotPeerAddress,
    InvalidId,
    PeerResponded,
    RetriesExhausted,
    Stop,
}

/// Transition table of the receiver
pub fn receiver_machine() -> StateMachine<ReceiverState, ReceiverEvent> {
    use ReceiverEvent::*;
    use ReceiverState::*;

    let mut machine = StateMachine::new();
    let lookup = machine.add_state(LookupAddress);
    let local_connect = machine.add_state(LocalConnect);
    let remote_connect = machine.add_state(RemoteConnect);
    let connected = machine.add_state(Connected);
    let invalid_id = machine.add_state(ReceiverState::InvalidId);

    machine.add_transition(lookup, GotPeerAddress, Next::State(local_connect));
    machine.add_transition(lookup, Timeout, Next::State(lookup));
    machine.add_transition(lookup, ReceiverEvent::InvalidId, Next::State(invalid_id));

    machine.add_transition(local_connect, Timeout, Next::State(remote_connect));
    machine.add_transition(local_connect, PeerResponded, Next::State(connected));

    machine.add_transition(remote_connect, Timeout, Next::State(remote_connect));
    machine.add_transition(remote_connect, PeerResponded, Next::State(connected));
    machine.add_transition(remote_connect, RetriesExhausted, Next::Stop);

    machine.add_transition(connected, Stop, Next::Stop);
    machine.add_transition(invalid_id, Stop, Next::Stop);
    machine
}

/// The peer that knows an identifier and goes looking for its sender
pub struct Receiver {
    endpoint: Endpoint,
    config: ClientConfig,
    sender_id: String,
    delegate: Option<Box<dyn ReceiverDelegate>>,
    remote_attempts_left: u32,
    cancel: CancellationToken,
}

impl Receiver {
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = Endpoint::open(config.server_addr)?;
        Ok(Self {
            endpoint,
            config,
            sender_id: String::new(),
            delegate: None,
            remote_attempts_left: 0,
            cancel: CancellationToken::new(),
        })
    }

    pub fn set_delegate(&mut self, delegate: impl ReceiverDelegate + 'static) {
        self.delegate = Some(Box::new(delegate));
    }

    /// Token that aborts `connect_to_sender` when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until connected to the sender registered as `sender_id`, the
    /// identifier turns out to be unknown, or the retry ladder runs out.
    pub async fn connect_to_sender(&mut self, sender_id: &str) -> Result<()> {
        self.sender_id = sender_id.to_string();

        let machine = receiver_machine();
        let cancel = self.cancel.clone();
        match machine.run(self, &cancel).await? {
            ReceiverState::Connected => Ok(()),
            ReceiverState::InvalidId => Err(HolePunchError::InvalidIdentifier(self.sender_id.clone())),
            _ => Err(HolePunchError::PeerUnreachable {
                attempts: self.config.remote_attempts(),
            }),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn has_peer_address(&self) -> bool {
        self.endpoint.has_peer_address()
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }

    pub fn connected_locally(&self) -> bool {
        self.endpoint.connected_locally()
    }

    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.endpoint.peer_address()
    }

    pub fn route(&self) -> Option<PeerRoute> {
        self.endpoint.route()
    }

    /// Hand over the connected socket
    pub fn into_socket(self) -> Result<UdpSocket> {
        self.endpoint.into_socket()
    }

    async fn lookup_address(&mut self) -> Result<ReceiverEvent> {
        let local = self.endpoint.local_addr();
        debug!(server = %self.endpoint.server_addr(), identifier = %self.sender_id, "looking up sender");
        self.endpoint
            .send_to_server(Request::connect(self.sender_id.clone(), local))
            .await?;

        let deadline = Instant::now() + self.config.retry_interval;
        let Some(response) = self.endpoint.recv_from_server(deadline).await? else {
            return Ok(ReceiverEvent::Timeout);
        };

        if response.kind != ResponseKind::Connect {
            warn!("Expected CONNECT response but got {:?}.", response.kind);
            return Ok(ReceiverEvent::Timeout);
        }

        if response.is_not_found() {
            warn!(identifier = %self.sender_id, "server doesn't know this identifier");
            return Ok(ReceiverEvent::InvalidId);
        }

        match self.endpoint.update_peer_addresses(&response) {
            Ok(()) => Ok(ReceiverEvent::GotPeerAddress),
            Err(_) => Ok(ReceiverEvent::Timeout),
        }
    }

    async fn local_connect(&mut self) -> Result<ReceiverEvent> {
        if self.endpoint.connect_local(self.config.retry_interval).await? {
            return Ok(ReceiverEvent::PeerResponded);
        }

        self.remote_attempts_left = self.config.remote_attempts();
        Ok(ReceiverEvent::Timeout)
    }

    async fn remote_connect(&mut self) -> Result<ReceiverEvent> {
        self.remote_attempts_left = self.remote_attempts_left.saturating_sub(1);

        if self.endpoint.connect_remote(self.config.retry_interval).await? {
            return Ok(ReceiverEvent::PeerResponded);
        }

        if self.remote_attempts_left > 0 {
            Ok(ReceiverEvent::Timeout)
        } else {
            warn!(identifier = %self.sender_id, "Peer never answered, giving up");
            Ok(ReceiverEvent::RetriesExhausted)
        }
    }
}

impl Automaton for Receiver {
    type State = ReceiverState;
    type Event = ReceiverEvent;
    type Error = HolePunchError;

    async fn enter(&mut self, state: ReceiverState) -> Result<ReceiverEvent> {
        match state {
            ReceiverState::LookupAddress => self.lookup_address().await,
            ReceiverState::LocalConnect => self.local_connect().await,
            ReceiverState::RemoteConnect => self.remote_connect().await,
            ReceiverState::Connected => {
                info!(peer = ?self.endpoint.peer_address(), route = ?self.endpoint.route(), "receiver connected");
                Ok(ReceiverEvent::Stop)
            }
            ReceiverState::InvalidId => {
                if let Some(delegate) = &self.delegate {
                    delegate.invalid_id();
                }
                Ok(ReceiverEvent::Stop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_ladder_stops_the_receiver() {
        let machine = receiver_machine();
        assert_eq!(machine.start_state(), Some(ReceiverState::LookupAddress));
        assert_eq!(
            machine.next(ReceiverState::RemoteConnect, ReceiverEvent::RetriesExhausted),
            Some(Next::Stop)
        );
        assert_eq!(
            machine.next(ReceiverState::RemoteConnect, ReceiverEvent::Timeout),
            Some(Next::State(ReceiverState::RemoteConnect))
        );
    }

    #[test]
    fn unknown_identifier_has_its_own_terminal_state() {
        let machine = receiver_machine();
        assert_eq!(
            machine.next(ReceiverState::LookupAddress, ReceiverEvent::InvalidId),
            Some(Next::State(ReceiverState::InvalidId))
        );
        assert_eq!(machine.next(ReceiverState::InvalidId, ReceiverEvent::Stop), Some(Next::Stop));
        assert_eq!(machine.next(ReceiverState::InvalidId, ReceiverEvent::Timeout), None);
    }
}
