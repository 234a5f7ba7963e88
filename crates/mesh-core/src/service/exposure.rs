//! What each connected peer says it exposes.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::ServiceLocator;
use crate::protocol::ServicesExposed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerServices {
    pub instance_id: String,
    pub services: Vec<ServiceLocator>,
    pub updated_at: DateTime<Utc>,
}

/// Per-peer exposure view. Each notification replaces the peer's previous set, and
/// any entry another session left behind for the same instance.
#[derive(Default)]
pub struct ExposedServiceTable {
    peers: DashMap<String, PeerServices>,
}

impl ExposedServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, peer: &str, event: ServicesExposed) {
        debug!(peer = %peer, instance = %event.instance_id, services = event.services.len(), "peer exposure updated");
        // A reconnecting instance arrives under a fresh peer id.
        self.peers.retain(|key, entry| key == peer || entry.instance_id != event.instance_id);
        self.peers.insert(
            peer.to_string(),
            PeerServices {
                instance_id: event.instance_id,
                services: event.services,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn remove_peer(&self, peer: &str) -> bool {
        self.peers.remove(peer).is_some()
    }

    pub fn services_of(&self, peer: &str) -> Option<PeerServices> {
        self.peers.get(peer).map(|entry| entry.clone())
    }

    /// Peers currently exposing `service_id`, sorted.
    pub fn peers_exposing(&self, service_id: u32) -> Vec<String> {
        let mut peers: Vec<_> = self
            .peers
            .iter()
            .filter(|entry| entry.services.iter().any(|s| s.id() == service_id))
            .map(|entry| entry.key().clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
