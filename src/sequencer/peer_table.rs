use std::collections::HashMap;

/// Delivery state the sender tracks per peer. Transitions are driven solely by packet
/// arrival, ack/nack arrival, and timers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerSyncState {
    /// Heard of, no ack yet.
    Unknown,
    /// Watermark advancing contiguously.
    Synced,
    /// The peer has an outstanding NACK against us.
    GapDetected,
    /// Retry budget exhausted or cache evicted past the peer; the peer must be healed by a
    /// full invalidate before incremental deltas mean anything again.
    ResyncRequired,
    /// Aged out by the silence timeout. Excluded from min-ack computation.
    Departed,
}

#[derive(Clone, Debug)]
pub struct PeerTracker {
    pub acked_up_to: u64,
    pub state: PeerSyncState,
    /// Highest id the peer has nacked; a cumulative ack at or past it clears the gap.
    gap_high: u64,
    /// Packet id of the full invalidate that heals this peer; an ack at or past it
    /// returns the peer to Synced.
    resync_barrier: u64,
}

impl PeerTracker {
    fn new() -> Self {
        PeerTracker {
            acked_up_to: 0,
            state: PeerSyncState::Unknown,
            gap_high: 0,
            resync_barrier: 0,
        }
    }
}

/// Per-peer acknowledgement watermarks plus the sync state machine. Mutated only under the
/// sequencer's peer lock; never while holding the cache lock across a network call.
pub struct PeerTable {
    peers: HashMap<String, PeerTracker>,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable { peers: HashMap::new() }
    }

    /// Apply a cumulative ack. The watermark is monotonic: a stale (lower) ack is ignored.
    pub fn record_ack(&mut self, peer: &str, acked_up_to: u64) {
        let tracker = self.peers.entry(peer.to_string()).or_insert_with(PeerTracker::new);
        if acked_up_to > tracker.acked_up_to {
            tracker.acked_up_to = acked_up_to;
        }

        match tracker.state {
            PeerSyncState::Unknown | PeerSyncState::Departed => {
                tracker.state = PeerSyncState::Synced;
            }
            PeerSyncState::GapDetected => {
                if tracker.acked_up_to >= tracker.gap_high {
                    tracker.state = PeerSyncState::Synced;
                }
            }
            PeerSyncState::ResyncRequired => {
                if tracker.resync_barrier > 0 && tracker.acked_up_to >= tracker.resync_barrier {
                    tracker.state = PeerSyncState::Synced;
                }
            }
            PeerSyncState::Synced => {}
        }
    }

    pub fn record_gap(&mut self, peer: &str, highest_missing: u64) {
        let tracker = self.peers.entry(peer.to_string()).or_insert_with(PeerTracker::new);
        if tracker.state != PeerSyncState::ResyncRequired {
            tracker.state = PeerSyncState::GapDetected;
        }
        if highest_missing > tracker.gap_high {
            tracker.gap_high = highest_missing;
        }
    }

    pub fn mark_resync_required(&mut self, peer: &str) {
        let tracker = self.peers.entry(peer.to_string()).or_insert_with(PeerTracker::new);
        // A barrier already recorded stays; the pending full invalidate covers this
        // escalation too.
        if tracker.state != PeerSyncState::ResyncRequired {
            tracker.state = PeerSyncState::ResyncRequired;
            tracker.resync_barrier = 0;
        }
    }

    /// Record the packet id of the full invalidate that will heal currently-lagging peers.
    pub fn set_resync_barrier(&mut self, peer: &str, barrier: u64) {
        if let Some(tracker) = self.peers.get_mut(peer) {
            if tracker.state == PeerSyncState::ResyncRequired && tracker.resync_barrier == 0 {
                tracker.resync_barrier = barrier;
            }
        }
    }

    /// Make sure a tracker exists for a peer we have heard any traffic from. A known peer
    /// that has never acked pins the group minimum at 0, so nothing it has not seen is
    /// garbage-collected out from under it.
    pub fn ensure_tracked(&mut self, peer: &str) {
        self.peers.entry(peer.to_string()).or_insert_with(PeerTracker::new);
    }

    pub fn mark_departed(&mut self, peer: &str) {
        if let Some(tracker) = self.peers.get_mut(peer) {
            tracker.state = PeerSyncState::Departed;
        }
    }

    pub fn state(&self, peer: &str) -> Option<PeerSyncState> {
        self.peers.get(peer).map(|t| t.state)
    }

    pub fn watermark(&self, peer: &str) -> Option<u64> {
        self.peers.get(peer).map(|t| t.acked_up_to)
    }

    /// Minimum watermark across peers still participating. Departed peers are excluded so
    /// they never wedge cache eviction. Returns None when no live peer has ever acked.
    pub fn min_acked(&self) -> Option<u64> {
        self.peers
            .values()
            .filter(|t| t.state != PeerSyncState::Departed)
            .map(|t| t.acked_up_to)
            .min()
    }

    /// Peers whose watermark is below `packet_id` and are still live: the ones that lose
    /// data if that packet is evicted.
    pub fn lagging_behind(&self, packet_id: u64) -> Vec<String> {
        self.peers
            .iter()
            .filter(|(_, t)| t.state != PeerSyncState::Departed && t.acked_up_to < packet_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn ack_digest(&self) -> String {
        let mut parts: Vec<String> = self
            .peers
            .iter()
            .map(|(id, t)| format!("{}:{}", id, t.acked_up_to))
            .collect();
        parts.sort();
        parts.join(",")
    }
}
