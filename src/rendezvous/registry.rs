/**
 * rendezvous/registry.rs
 *
 * Identifier to address pair table held by the rendezvous server
 */

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::nat_traversal::AddressPair;

/// Mint a fresh identifier: a random UUID, upper case and hyphenated
pub fn mint_identifier() -> String {
    let uuid = uuid::Builder::from_random_bytes(rand::random()).into_uuid();
    uuid.hyphenated().to_string().to_uppercase()
}

#[derive(Debug, Clone)]
struct Registration {
    addresses: AddressPair,
    last_seen: Instant,
}

/// Registered senders. Last write wins; entries only leave through `evict_expired`.
#[derive(Debug, Default)]
pub struct Registry {
    entries: HashMap<String, Registration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `addresses` under a new identifier and return it
    pub fn register(&mut self, addresses: AddressPair) -> String {
        let identifier = mint_identifier();
        self.entries.insert(
            identifier.clone(),
            Registration {
                addresses,
                last_seen: Instant::now(),
            },
        );
        identifier
    }

    /// Replace the addresses of a known identifier. False if it is unknown.
    pub fn heartbeat(&mut self, identifier: &str, addresses: AddressPair) -> bool {
        match self.entries.get_mut(identifier) {
            Some(registration) => {
                registration.addresses = addresses;
                registration.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, identifier: &str) -> Option<AddressPair> {
        self.entries.get(identifier).map(|r| r.addresses)
    }

    /// Drop registrations not refreshed within `ttl` of `now`.
    /// Returns how many were removed.
    pub fn evict_expired(&mut self, ttl: Duration, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, registration| now.saturating_duration_since(registration.last_seen) <= ttl);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
