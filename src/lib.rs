#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod error;
pub mod fsm;
pub mod nat_traversal;
pub mod rendezvous;

pub use error::{HolePunchError, Result};
pub use fsm::{Automaton, MachineError, Next, StateMachine};
pub use nat_traversal::{ClientConfig, Endpoint, PeerRoute, Receiver, Sender};
pub use rendezvous::{RendezvousServer, ServerConfig};
