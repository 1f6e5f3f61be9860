/**
 * nat_traversal/sender.rs
 *
 * Sender side: register with the rendezvous server, keep the registration
 * fresh, and punch through to whichever receiver asks for us.
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

/// Notified when the server assigns an identifier
pub trait SenderDelegate: Send + Sync {
    fn got_id(&self, identifier: &str);
}

impl<F> SenderDelegate for F
where
    F: Fn(&str) + Send + Sync,
{
    fn got_id(&self, identifier: &str) {
        self(identifier)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderState {
    AssignId,
    WaitForPeerAddress,
    UpdateAddress,
    LocalConnect,
    RemoteConnect,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SenderEvent {
    Timeout,
    GotId,
    GotPeerAddress,
    UpdateAcked,
    HeartbeatRejected,
    PeerResponded,
    RetriesExhausted,
    Stop,
}

/// Transition table of the sender
pub fn sender_machine() -> StateMachine<SenderState, SenderEvent> {
    use SenderEvent::*;
    use SenderState::*;

    let mut machine = StateMachine::new();
    let assign_id = machine.add_state(AssignId);
    let wait_for_peer = machine.add_state(WaitForPeerAddress);
    let update_address = machine.add_state(UpdateAddress);
    let local_connect = machine.add_state(LocalConnect);
    let remote_connect = machine.add_state(RemoteConnect);
    let connected = machine.add_state(Connected);

    machine.add_transition(assign_id, Timeout, Next::State(assign_id));
    machine.add_transition(assign_id, GotId, Next::State(wait_for_peer));

    machine.add_transition(wait_for_peer, Timeout, Next::State(update_address));
    machine.add_transition(wait_for_peer, GotPeerAddress, Next::State(local_connect));

    machine.add_transition(update_address, Timeout, Next::State(update_address));
    machine.add_transition(update_address, UpdateAcked, Next::State(wait_for_peer));
    machine.add_transition(update_address, HeartbeatRejected, Next::State(assign_id));
    machine.add_transition(update_address, GotPeerAddress, Next::State(local_connect));

    machine.add_transition(local_connect, Timeout, Next::State(remote_connect));
    machine.add_transition(local_connect, PeerResponded, Next::State(connected));

    machine.add_transition(remote_connect, Timeout, Next::State(remote_connect));
    machine.add_transition(remote_connect, PeerResponded, Next::State(connected));
    machine.add_transition(remote_connect, RetriesExhausted, Next::State(assign_id));

    machine.add_transition(connected, Stop, Next::Stop);
    machine
}

/// The peer that registers and waits to be found
pub struct Sender {
    endpoint: Endpoint,
    config: ClientConfig,
    identifier: Option<String>,
    delegate: Option<Box<dyn SenderDelegate>>,
    remote_attempts_left: u32,
    cancel: CancellationToken,
}

impl Sender {
    /// Must be called from within a Tokio runtime.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = Endpoint::open(config.server_addr)?;
        Ok(Self {
            endpoint,
            config,
            identifier: None,
            delegate: None,
            remote_attempts_left: 0,
            cancel: CancellationToken::new(),
        })
    }

    pub fn set_delegate(&mut self, delegate: impl SenderDelegate + 'static) {
        self.delegate = Some(Box::new(delegate));
    }

    /// Token that aborts `connect_to_receiver` when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Block until a receiver has connected.
    pub async fn connect_to_receiver(&mut self) -> Result<()> {
        let machine = sender_machine();
        let cancel = self.cancel.clone();
        let last = machine.run(self, &cancel).await?;
        debug_assert_eq!(last, SenderState::Connected);
        Ok(())
    }

    /// Identifier most recently assigned by the server
    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
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

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.retry_interval
    }

    async fn assign_id(&mut self) -> Result<SenderEvent> {
        let local = self.endpoint.local_addr();
        debug!(server = %self.endpoint.server_addr(), %local, "registering");
        self.endpoint.send_to_server(Request::register(local)).await?;

        let Some(response) = self.endpoint.recv_from_server(self.deadline()).await? else {
            debug!("No REGISTER response, retrying");
            return Ok(SenderEvent::Timeout);
        };

        if response.kind != ResponseKind::Register {
            warn!("Expected REGISTER response but got {:?}. Treating like a timeout.", response.kind);
            return Ok(SenderEvent::Timeout);
        }

        match response.identifier {
            Some(identifier) => {
                info!(%identifier, "registered with rendezvous server");
                if let Some(delegate) = &self.delegate {
                    delegate.got_id(&identifier);
                }
                self.identifier = Some(identifier);
                Ok(SenderEvent::GotId)
            }
            None => {
                warn!("Got response but it didn't have an identifier. Treating like a timeout.");
                Ok(SenderEvent::Timeout)
            }
        }
    }

    async fn wait_for_peer_address(&mut self) -> Result<SenderEvent> {
        let Some(response) = self.endpoint.recv_from_server(self.deadline()).await? else {
            return Ok(SenderEvent::Timeout);
        };

        if response.kind != ResponseKind::Connect {
            warn!("Expected a CONNECT but got {:?}. Treating like a timeout.", response.kind);
            return Ok(SenderEvent::Timeout);
        }

        match self.endpoint.update_peer_addresses(&response) {
            Ok(()) => Ok(SenderEvent::GotPeerAddress),
            Err(_) => Ok(SenderEvent::Timeout),
        }
    }

    async fn update_address(&mut self) -> Result<SenderEvent> {
        let identifier = self.identifier.clone().ok_or(HolePunchError::NotRegistered)?;
        let local = self.endpoint.local_addr();
        self.endpoint
            .send_to_server(Request::heartbeat(identifier, local))
            .await?;

        let Some(response) = self.endpoint.recv_from_server(self.deadline()).await? else {
            return Ok(SenderEvent::Timeout);
        };

        match response.kind {
            ResponseKind::Heartbeat if response.succeeded() => Ok(SenderEvent::UpdateAcked),
            ResponseKind::Heartbeat => {
                warn!("Heartbeat request failed, registering again");
                Ok(SenderEvent::HeartbeatRejected)
            }
            ResponseKind::Connect => match self.endpoint.update_peer_addresses(&response) {
                Ok(()) => Ok(SenderEvent::GotPeerAddress),
                Err(_) => Ok(SenderEvent::Timeout),
            },
            ResponseKind::Register => {
                warn!("Got something besides a heartbeat response. Treating like a timeout.");
                Ok(SenderEvent::Timeout)
            }
        }
    }

    async fn local_connect(&mut self) -> Result<SenderEvent> {
        if self.endpoint.connect_local(self.config.retry_interval).await? {
            return Ok(SenderEvent::PeerResponded);
        }

        self.remote_attempts_left = self.config.remote_attempts();
        Ok(SenderEvent::Timeout)
    }

    async fn remote_connect(&mut self) -> Result<SenderEvent> {
        self.remote_attempts_left = self.remote_attempts_left.saturating_sub(1);

        if self.endpoint.connect_remote(self.config.retry_interval).await? {
            return Ok(SenderEvent::PeerResponded);
        }

        if self.remote_attempts_left > 0 {
            Ok(SenderEvent::Timeout)
        } else {
            warn!("Peer never answered, registering again");
            Ok(SenderEvent::RetriesExhausted)
        }
    }
}

impl Automaton for Sender {
    type State = SenderState;
    type Event = SenderEvent;
    type Error = HolePunchError;

    async fn enter(&mut self, state: SenderState) -> Result<SenderEvent> {
        match state {
            SenderState::AssignId => self.assign_id().await,
            SenderState::WaitForPeerAddress => self.wait_for_peer_address().await,
            SenderState::UpdateAddress => self.update_address().await,
            SenderState::LocalConnect => self.local_connect().await,
            SenderState::RemoteConnect => self.remote_connect().await,
            SenderState::Connected => {
                info!(peer = ?self.endpoint.peer_address(), route = ?self.endpoint.route(), "sender connected");
                Ok(SenderEvent::Stop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_ladder_loops_back_to_registration() {
        let machine = sender_machine();
        assert_eq!(machine.start_state(), Some(SenderState::AssignId));
        assert_eq!(
            machine.next(SenderState::RemoteConnect, SenderEvent::Timeout),
            Some(Next::State(SenderState::RemoteConnect))
        );
        assert_eq!(
            machine.next(SenderState::RemoteConnect, SenderEvent::RetriesExhausted),
            Some(Next::State(SenderState::AssignId))
        );
    }

    #[test]
    fn connect_during_heartbeat_short_circuits() {
        let machine = sender_machine();
        assert_eq!(
            machine.next(SenderState::UpdateAddress, SenderEvent::GotPeerAddress),
            Some(Next::State(SenderState::LocalConnect))
        );
        assert_eq!(
            machine.next(SenderState::UpdateAddress, SenderEvent::HeartbeatRejected),
            Some(Next::State(SenderState::AssignId))
        );
        assert_eq!(
            machine.next(SenderState::WaitForPeerAddress, SenderEvent::Timeout),
            Some(Next::State(SenderState::UpdateAddress))
        );
    }

    #[test]
    fn connected_is_terminal() {
        let machine = sender_machine();
        assert_eq!(machine.next(SenderState::Connected, SenderEvent::Stop), Some(Next::Stop));
    }
}
