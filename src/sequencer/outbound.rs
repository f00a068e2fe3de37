use crate::sequencer::membership::GroupMembership;
use crate::sequencer::peer_table::{PeerSyncState, PeerTable};
use crate::wire::Packet;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Send side of the reliability layer: assigns packet ids, retains unacknowledged packets,
/// tracks per-peer watermarks, and decides what to resend or escalate.
///
/// Transport-agnostic: callers feed it acks/nacks and drive the periodic sweep; it hands
/// back packets to (re)transmit. The cache, the watermark table and the membership set sit
/// under separate locks so the send path and the ack path do not serialize each other, and
/// no lock is ever held across a network call.
pub struct OutboundSequencer {
    logger: slog::Logger,
    sender_id: String,
    group_epoch: u32,
    resend_timeout: Duration,
    retry_budget: u32,
    cache: Mutex<OutgoingPacketCache>,
    peers: Mutex<PeerTable>,
    membership: Mutex<GroupMembership>,
}

struct OutgoingPacketCache {
    next_packet_id: u64,
    entries: BTreeMap<u64, CachedPacket>,
    capacity: usize,
}

struct CachedPacket {
    packet: Packet,
    last_sent: Instant,
    attempts: u32,
}

/// A freshly sequenced packet, plus any peers that had to be escalated because capacity
/// eviction dropped packets they had not yet acknowledged.
pub struct Prepared {
    pub packet: Packet,
    pub escalated: Vec<String>,
}

pub struct NackReply {
    pub resend: Vec<Packet>,
    /// True when a nacked id was already evicted; the peer cannot be healed incrementally.
    pub resync_required: bool,
}

pub struct Sweep {
    pub resend: Vec<Packet>,
    /// Peers whose retry budget exhausted; they need a full invalidate.
    pub resync_peers: Vec<String>,
    pub departed: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SequencerSnapshot {
    pub current_packet_id: u64,
    pub min_acked_packet_id: u64,
    pub outgoing_cache_size: usize,
    pub group_size: usize,
    pub ack_digest: String,
}

impl OutboundSequencer {
    pub fn new(
        logger: slog::Logger,
        sender_id: String,
        group_epoch: u32,
        resend_timeout: Duration,
        retry_budget: u32,
        cache_capacity: usize,
        silence_timeout: Duration,
    ) -> Self {
        OutboundSequencer {
            logger,
            sender_id,
            group_epoch,
            resend_timeout,
            retry_budget,
            cache: Mutex::new(OutgoingPacketCache {
                next_packet_id: 1,
                entries: BTreeMap::new(),
                capacity: cache_capacity,
            }),
            peers: Mutex::new(PeerTable::new()),
            membership: Mutex::new(GroupMembership::new(silence_timeout)),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn group_epoch(&self) -> u32 {
        self.group_epoch
    }

    /// Assign the next packet id and retain the packet until the whole group acks it.
    /// Over capacity, the oldest entry is evicted and still-lagging peers are escalated.
    pub fn next_packet(&self, payload: Bytes, now: Instant) -> Prepared {
        let mut evicted_ids = Vec::new();

        let packet = {
            let mut cache = self.cache.lock().unwrap();

            while cache.entries.len() >= cache.capacity {
                // BTreeMap iterates in id order, so the first key is the oldest packet.
                let oldest_id = *cache.entries.keys().next().unwrap();
                cache.entries.remove(&oldest_id);
                evicted_ids.push(oldest_id);
            }

            let packet_id = cache.next_packet_id;
            cache.next_packet_id += 1;

            let packet = Packet {
                sender_id: self.sender_id.clone(),
                group_epoch: self.group_epoch,
                packet_id,
                payload,
            };
            cache.entries.insert(
                packet_id,
                CachedPacket {
                    packet: packet.clone(),
                    last_sent: now,
                    attempts: 0,
                },
            );
            packet
        };

        let mut escalated = Vec::new();
        if !evicted_ids.is_empty() {
            let mut peers = self.peers.lock().unwrap();
            for oldest_id in evicted_ids {
                for peer in peers.lagging_behind(oldest_id) {
                    if peers.state(&peer) != Some(PeerSyncState::ResyncRequired) {
                        slog::warn!(
                            self.logger,
                            "Outgoing cache overflow evicted packet {} before peer '{}' acked; peer requires resync",
                            oldest_id,
                            peer
                        );
                        peers.mark_resync_required(&peer);
                        escalated.push(peer);
                    }
                }
            }
        }

        Prepared { packet, escalated }
    }

    /// Any traffic from a peer proves liveness, even when it carries no ack for us. The
    /// peer is tracked at watermark 0 from first contact, so packets it has not acked are
    /// retained for resend instead of being collected as if nobody were listening.
    pub fn note_traffic(&self, peer: &str, now: Instant) {
        let newly_joined = {
            let mut membership = self.membership.lock().unwrap();
            membership.touch(peer, now)
        };
        if newly_joined {
            slog::info!(self.logger, "Peer '{}' joined the broadcast group", peer);
        }
        self.peers.lock().unwrap().ensure_tracked(peer);
    }

    /// Apply a cumulative ack from a peer and free cache entries the whole group has seen.
    pub fn record_ack(&self, peer: &str, acked_up_to: u64, now: Instant) {
        {
            let mut membership = self.membership.lock().unwrap();
            if membership.touch(peer, now) {
                slog::info!(self.logger, "Peer '{}' joined the broadcast group", peer);
            }
        }
        {
            let mut peers = self.peers.lock().unwrap();
            peers.record_ack(peer, acked_up_to);
        }
        self.gc();
    }

    /// A peer reported holes. Hand back the cached packets to resend; holes already evicted
    /// mean the peer can only be healed by a full invalidate.
    pub fn record_nack(&self, peer: &str, missing: &[u64], now: Instant) -> NackReply {
        {
            let mut membership = self.membership.lock().unwrap();
            membership.touch(peer, now);
        }

        let mut resend = Vec::new();
        let mut resync_required = false;
        {
            let cache = self.cache.lock().unwrap();
            for id in missing {
                match cache.entries.get(id) {
                    Some(cached) => resend.push(cached.packet.clone()),
                    None => {
                        // Evicted or never existed; incremental repair is impossible.
                        if *id < cache.next_packet_id {
                            resync_required = true;
                        }
                    }
                }
            }
        }

        let mut peers = self.peers.lock().unwrap();
        if resync_required {
            slog::warn!(
                self.logger,
                "Peer '{}' nacked already-evicted packets {:?}; peer requires resync",
                peer,
                missing
            );
            peers.mark_resync_required(peer);
        } else if let Some(high) = missing.iter().max() {
            peers.record_gap(peer, *high);
        }

        NackReply { resend, resync_required }
    }

    /// Periodic maintenance: expire silent peers, free fully-acked packets, resend stale
    /// ones, and escalate packets whose retry budget is spent.
    pub fn sweep(&self, now: Instant) -> Sweep {
        let departed = {
            let mut membership = self.membership.lock().unwrap();
            membership.expire(now)
        };
        if !departed.is_empty() {
            let mut peers = self.peers.lock().unwrap();
            for peer in &departed {
                slog::info!(self.logger, "Peer '{}' silent past timeout, marking departed", peer);
                peers.mark_departed(peer);
            }
        }

        self.gc();

        let min_acked = self.min_acked();
        let mut resend = Vec::new();
        let mut exhausted = Vec::new();
        {
            let mut cache = self.cache.lock().unwrap();
            for (id, cached) in cache.entries.iter_mut() {
                if *id <= min_acked {
                    continue;
                }
                if now.duration_since(cached.last_sent) < self.resend_timeout {
                    continue;
                }
                if cached.attempts < self.retry_budget {
                    cached.attempts += 1;
                    cached.last_sent = now;
                    resend.push(cached.packet.clone());
                } else {
                    exhausted.push(*id);
                }
            }
        }

        let mut resync_peers = Vec::new();
        if !exhausted.is_empty() {
            {
                let mut cache = self.cache.lock().unwrap();
                for id in &exhausted {
                    cache.entries.remove(id);
                }
            }
            let mut peers = self.peers.lock().unwrap();
            for id in exhausted {
                slog::warn!(
                    self.logger,
                    "Packet {} unacknowledged after {} attempts, giving up on incremental delivery",
                    id,
                    self.retry_budget
                );
                for peer in peers.lagging_behind(id) {
                    peers.mark_resync_required(&peer);
                    if !resync_peers.contains(&peer) {
                        resync_peers.push(peer);
                    }
                }
            }
        }

        Sweep {
            resend,
            resync_peers,
            departed,
        }
    }

    /// Record which full-invalidate packet heals the given peers (see the resync path in
    /// the multicast transport).
    pub fn set_resync_barrier(&self, peer_ids: &[String], barrier: u64) {
        let mut peers = self.peers.lock().unwrap();
        for peer in peer_ids {
            peers.set_resync_barrier(peer, barrier);
        }
    }

    pub fn peer_state(&self, peer: &str) -> Option<PeerSyncState> {
        self.peers.lock().unwrap().state(peer)
    }

    pub fn snapshot(&self) -> SequencerSnapshot {
        let (current_packet_id, outgoing_cache_size) = {
            let cache = self.cache.lock().unwrap();
            (cache.next_packet_id.saturating_sub(1), cache.entries.len())
        };
        let (min_acked_from_peers, ack_digest) = {
            let peers = self.peers.lock().unwrap();
            (peers.min_acked(), peers.ack_digest())
        };
        let group_size = self.membership.lock().unwrap().len();

        SequencerSnapshot {
            current_packet_id,
            min_acked_packet_id: min_acked_from_peers.unwrap_or(current_packet_id),
            outgoing_cache_size,
            group_size,
            ack_digest,
        }
    }

    /// Group minimum across tracked peers. A known peer that has never acked holds this at
    /// 0. Only with no peer ever heard from is everything already sent collectable.
    /// Locks are taken one at a time, never nested.
    fn min_acked(&self) -> u64 {
        let highest_assigned = {
            let cache = self.cache.lock().unwrap();
            cache.next_packet_id.saturating_sub(1)
        };
        let peers = self.peers.lock().unwrap();
        peers.min_acked().unwrap_or(highest_assigned)
    }

    fn gc(&self) {
        let min = self.min_acked();
        let mut cache = self.cache.lock().unwrap();
        let keep = cache.entries.split_off(&(min + 1));
        cache.entries = keep;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequencer(capacity: usize, retry_budget: u32) -> OutboundSequencer {
        OutboundSequencer::new(
            slog::Logger::root(slog::Discard, slog::o!()),
            "node-a".to_string(),
            1,
            Duration::from_millis(100),
            retry_budget,
            capacity,
            Duration::from_secs(30),
        )
    }

    fn payload() -> Bytes {
        Bytes::from_static(b"payload")
    }

    #[test]
    fn packet_ids_are_gap_free_from_one() {
        let seq = sequencer(16, 3);
        let now = Instant::now();
        for expect in 1..=5u64 {
            let prepared = seq.next_packet(payload(), now);
            assert_eq!(prepared.packet.packet_id, expect);
            assert!(prepared.escalated.is_empty());
        }
    }

    #[test]
    fn known_unacked_peer_keeps_unseen_packets_resendable() {
        let seq = sequencer(16, 3);
        let t0 = Instant::now();
        // node-b has broadcast to us but never acked our stream.
        seq.note_traffic("node-b", t0);
        seq.next_packet(payload(), t0);

        let snapshot = seq.snapshot();
        assert_eq!(snapshot.min_acked_packet_id, 0);
        assert_eq!(snapshot.outgoing_cache_size, 1);

        // First transmission lost on the wire: the sweep must resend, not forget.
        let sweep = seq.sweep(t0 + Duration::from_millis(200));
        assert_eq!(sweep.resend.len(), 1);
        assert_eq!(sweep.resend[0].packet_id, 1);

        seq.record_ack("node-b", 1, t0 + Duration::from_millis(250));
        assert_eq!(seq.snapshot().outgoing_cache_size, 0);
    }

    #[test]
    fn acked_packets_are_freed_up_to_group_minimum() {
        let seq = sequencer(16, 3);
        let now = Instant::now();
        for _ in 0..5 {
            seq.next_packet(payload(), now);
        }

        seq.record_ack("node-b", 3, now);
        seq.record_ack("node-c", 5, now);

        let snapshot = seq.snapshot();
        assert_eq!(snapshot.min_acked_packet_id, 3);
        // Packets 4 and 5 must survive: node-b has not seen them.
        assert_eq!(snapshot.outgoing_cache_size, 2);
    }

    #[test]
    fn nack_returns_cached_packets_for_resend() {
        let seq = sequencer(16, 3);
        let now = Instant::now();
        for _ in 0..5 {
            seq.next_packet(payload(), now);
        }
        seq.record_ack("node-b", 2, now);

        let reply = seq.record_nack("node-b", &[3], now);
        assert!(!reply.resync_required);
        assert_eq!(reply.resend.len(), 1);
        assert_eq!(reply.resend[0].packet_id, 3);
        assert_eq!(seq.peer_state("node-b"), Some(PeerSyncState::GapDetected));
    }

    #[test]
    fn nack_for_evicted_packet_escalates_to_resync() {
        let seq = sequencer(2, 3);
        let now = Instant::now();
        // Capacity 2: sequencing 1..=3 with no peers known evicts packet 1 silently
        // (nobody is lagging yet).
        for _ in 0..3 {
            seq.next_packet(payload(), now);
        }

        let reply = seq.record_nack("node-b", &[1], now);
        assert!(reply.resync_required);
        assert!(reply.resend.is_empty());
        assert_eq!(seq.peer_state("node-b"), Some(PeerSyncState::ResyncRequired));
    }

    #[test]
    fn capacity_eviction_escalates_lagging_peer() {
        let seq = sequencer(2, 3);
        let now = Instant::now();
        seq.next_packet(payload(), now);
        seq.next_packet(payload(), now);
        seq.record_ack("node-b", 0, now);

        let prepared = seq.next_packet(payload(), now);
        assert_eq!(prepared.escalated, vec!["node-b".to_string()]);
        assert_eq!(seq.peer_state("node-b"), Some(PeerSyncState::ResyncRequired));
    }

    #[test]
    fn sweep_resends_stale_unacked_packets_with_bounded_retries() {
        let seq = sequencer(16, 2);
        let t0 = Instant::now();
        seq.next_packet(payload(), t0);
        seq.record_ack("node-b", 0, t0);

        // Not stale yet.
        let sweep = seq.sweep(t0 + Duration::from_millis(50));
        assert!(sweep.resend.is_empty());

        // Two sweeps past the resend timeout consume the retry budget.
        let sweep = seq.sweep(t0 + Duration::from_millis(200));
        assert_eq!(sweep.resend.len(), 1);
        let sweep = seq.sweep(t0 + Duration::from_millis(400));
        assert_eq!(sweep.resend.len(), 1);

        // Third sweep: budget exhausted, peer escalated, packet dropped.
        let sweep = seq.sweep(t0 + Duration::from_millis(600));
        assert!(sweep.resend.is_empty());
        assert_eq!(sweep.resync_peers, vec!["node-b".to_string()]);
        assert_eq!(seq.snapshot().outgoing_cache_size, 0);
    }

    #[test]
    fn departed_peer_does_not_block_eviction() {
        let seq = sequencer(16, 3);
        let t0 = Instant::now();
        for _ in 0..5 {
            seq.next_packet(payload(), t0);
        }
        seq.record_ack("node-b", 1, t0);
        seq.record_ack("node-c", 5, t0 + Duration::from_secs(29));

        // node-b goes silent past the 30s timeout; node-c stays fresh.
        let sweep = seq.sweep(t0 + Duration::from_secs(31));
        assert_eq!(sweep.departed, vec!["node-b".to_string()]);

        let snapshot = seq.snapshot();
        assert_eq!(snapshot.min_acked_packet_id, 5);
        assert_eq!(snapshot.outgoing_cache_size, 0);
    }

    #[test]
    fn resync_peer_heals_at_barrier() {
        let seq = sequencer(16, 0);
        let t0 = Instant::now();
        seq.next_packet(payload(), t0);
        seq.record_ack("node-b", 0, t0);

        // Zero retry budget: first stale sweep escalates immediately.
        let sweep = seq.sweep(t0 + Duration::from_millis(200));
        assert_eq!(sweep.resync_peers, vec!["node-b".to_string()]);

        let healing = seq.next_packet(payload(), t0 + Duration::from_millis(200));
        seq.set_resync_barrier(&sweep.resync_peers, healing.packet.packet_id);

        seq.record_ack("node-b", healing.packet.packet_id, t0 + Duration::from_millis(300));
        assert_eq!(seq.peer_state("node-b"), Some(PeerSyncState::Synced));
    }
}
