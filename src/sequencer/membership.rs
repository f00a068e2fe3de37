use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The set of peers this node currently considers live, keyed by node id with the time we
/// last heard any traffic from them. Entries age out after the silence timeout so a departed
/// peer cannot permanently block outgoing cache eviction.
pub struct GroupMembership {
    members: HashMap<String, Instant>,
    silence_timeout: Duration,
}

impl GroupMembership {
    pub fn new(silence_timeout: Duration) -> Self {
        GroupMembership {
            members: HashMap::new(),
            silence_timeout,
        }
    }

    /// Record traffic from a peer. Returns true if the peer is newly joined (or rejoined).
    pub fn touch(&mut self, peer: &str, now: Instant) -> bool {
        self.members.insert(peer.to_string(), now).is_none()
    }

    /// Drop peers that have been silent past the timeout. Returns the ids removed.
    pub fn expire(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.silence_timeout;
        let departed: Vec<String> = self
            .members
            .iter()
            .filter(|(_, last_seen)| now.duration_since(**last_seen) >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &departed {
            self.members.remove(id);
        }
        departed
    }

    pub fn is_live(&self, peer: &str) -> bool {
        self.members.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}
