/**
 * rendezvous/mod.rs
 *
 * Rendezvous server:
 * - Identifier registry
 * - Request dispatch and the UDP serve loop
 */

mod registry;
mod server;

pub use registry::{mint_identifier, Registry};
pub use server::{run_rendezvous_server, RendezvousServer, ServerConfig, DEFAULT_PORT};
