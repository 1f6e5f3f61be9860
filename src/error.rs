/**
 * error.rs
 *
 * Error types shared by the endpoint, the automata and the rendezvous server
 */

use thiserror::Error;

use crate::fsm::MachineError;
use crate::nat_traversal::WireError;

/// Errors surfaced by hole punching operations.
#[derive(Debug, Error)]
pub enum HolePunchError {
    /// Socket I/O failed.
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),

    /// A message could not be encoded or decoded.
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// An address string from the wire is not a valid IP address.
    #[error("Invalid address {address}:{port}")]
    InvalidAddress { address: String, port: u16 },

    /// The rendezvous server does not know the requested identifier.
    #[error("Unknown identifier: {0}")]
    InvalidIdentifier(String),

    /// Every handshake attempt on the retry ladder timed out.
    #[error("Peer unreachable after {attempts} remote attempts")]
    PeerUnreachable { attempts: u32 },

    /// The socket was requested before a handshake succeeded.
    #[error("Endpoint is not connected to a peer")]
    NotConnected,

    /// A heartbeat was attempted before the server assigned an identifier.
    #[error("No identifier assigned yet")]
    NotRegistered,

    /// A handshake was attempted before the peer's addresses were learned.
    #[error("Peer address unknown")]
    NoPeerAddress,

    /// The state machine stopped abnormally.
    #[error(transparent)]
    Machine(#[from] MachineError),
}

impl HolePunchError {
    /// True when the machine was stopped through its cancellation token.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HolePunchError::Machine(MachineError::Cancelled { .. }))
    }
}

pub type Result<T, E = HolePunchError> = std::result::Result<T, E>;
