use crate::wire::Packet;
use std::collections::{BTreeMap, HashSet};

/// Receive side of the reliability layer, one per remote sender. Restores per-sender
/// packet-id order before anything reaches cache invalidation: contiguous packets are
/// delivered immediately, out-of-order arrivals wait in a bounded reorder buffer, and
/// duplicates are discarded.
pub struct InboundSequencer {
    origin_id: String,
    /// Epoch of the packets we are currently sequencing. None until the first packet.
    epoch: Option<u32>,
    last_delivered: u64,
    pending: BTreeMap<u64, Packet>,
    reorder_window: usize,
    /// Holes we have already nacked, so one loss does not produce a nack per later packet.
    nacked: HashSet<u64>,
    /// Watermark included in the last ack we emitted.
    last_emitted_ack: u64,
}

/// Outcome of accepting one packet.
#[derive(Debug, Default)]
pub struct Accepted {
    /// Packets now deliverable, in packet-id order.
    pub deliver: Vec<Packet>,
    /// Holes to report to the sender, if any new ones appeared.
    pub nack: Option<Vec<u64>>,
    pub duplicate: bool,
}

impl InboundSequencer {
    pub fn new(origin_id: String, reorder_window: usize) -> Self {
        InboundSequencer {
            origin_id,
            epoch: None,
            last_delivered: 0,
            pending: BTreeMap::new(),
            reorder_window,
            nacked: HashSet::new(),
            last_emitted_ack: 0,
        }
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_id
    }

    pub fn accept(&mut self, packet: Packet) -> Accepted {
        match self.epoch {
            None => return self.adopt_stream(packet),
            Some(epoch) if epoch != packet.group_epoch => {
                // Sender restarted. Reset expectations; never gap-fill across epochs.
                self.pending.clear();
                self.nacked.clear();
                self.last_emitted_ack = 0;
                return self.adopt_stream(packet);
            }
            Some(_) => {}
        }

        self.sequence(packet)
    }

    /// First packet seen from an epoch. Ids start at 1, so a first contact within the
    /// reorder window means the prefix 1..id is a recoverable loss and is nacked like any
    /// other gap. Deeper than the window we joined a long-running stream mid-flight, and
    /// history from before we joined is not ours to recover.
    fn adopt_stream(&mut self, packet: Packet) -> Accepted {
        self.epoch = Some(packet.group_epoch);
        if (packet.packet_id as usize) <= self.reorder_window {
            self.last_delivered = 0;
            self.sequence(packet)
        } else {
            self.last_delivered = packet.packet_id;
            Accepted {
                deliver: vec![packet],
                ..Accepted::default()
            }
        }
    }

    fn sequence(&mut self, packet: Packet) -> Accepted {
        let id = packet.packet_id;
        if id <= self.last_delivered || self.pending.contains_key(&id) {
            return Accepted {
                duplicate: true,
                ..Accepted::default()
            };
        }

        if id == self.last_delivered + 1 {
            let mut deliver = vec![packet];
            self.last_delivered = id;
            self.nacked.remove(&id);

            // Drain any buffered packets that are now contiguous.
            while let Some(next) = self.pending.remove(&(self.last_delivered + 1)) {
                self.last_delivered = next.packet_id;
                self.nacked.remove(&next.packet_id);
                deliver.push(next);
            }
            return Accepted {
                deliver,
                ..Accepted::default()
            };
        }

        // Ahead of the watermark: a gap. Buffer within the window and nack the new holes.
        if self.pending.len() >= self.reorder_window {
            // Buffer full; drop and let the sender's resend sweep recover this one.
            return Accepted::default();
        }
        self.pending.insert(id, packet);

        let mut new_holes = Vec::new();
        for missing in (self.last_delivered + 1)..id {
            if !self.pending.contains_key(&missing) && self.nacked.insert(missing) {
                new_holes.push(missing);
            }
        }

        Accepted {
            nack: if new_holes.is_empty() { None } else { Some(new_holes) },
            ..Accepted::default()
        }
    }

    /// Accept a packet that supersedes any earlier loss, i.e. one carrying a full
    /// invalidate. Holes below it stop mattering: the stream position is adopted at this
    /// packet and buffered successors drain as usual. Duplicates are still suppressed.
    pub fn accept_authoritative(&mut self, packet: Packet) -> Accepted {
        match self.epoch {
            Some(epoch) if epoch == packet.group_epoch => {}
            _ => {
                // First contact or epoch change: the full invalidate supersedes whatever
                // the missing prefix carried, so adopt at this packet with no backfill.
                self.epoch = Some(packet.group_epoch);
                self.pending.clear();
                self.nacked.clear();
                self.last_emitted_ack = 0;
                self.last_delivered = packet.packet_id;
                return Accepted {
                    deliver: vec![packet],
                    ..Accepted::default()
                };
            }
        }

        let id = packet.packet_id;
        if id <= self.last_delivered {
            return Accepted {
                duplicate: true,
                ..Accepted::default()
            };
        }

        self.last_delivered = id;
        self.pending = self.pending.split_off(&(id + 1));
        self.nacked.retain(|hole| *hole > id);

        let mut deliver = vec![packet];
        while let Some(next) = self.pending.remove(&(self.last_delivered + 1)) {
            self.last_delivered = next.packet_id;
            self.nacked.remove(&next.packet_id);
            deliver.push(next);
        }

        Accepted {
            deliver,
            ..Accepted::default()
        }
    }

    /// Cumulative ack to emit on the periodic timer, or None if the watermark has not
    /// advanced since the last emission. Acks are timer-driven, not per-packet, to bound
    /// ack chatter.
    pub fn take_ack(&mut self) -> Option<u64> {
        if self.last_delivered > self.last_emitted_ack {
            self.last_emitted_ack = self.last_delivered;
            Some(self.last_delivered)
        } else {
            None
        }
    }

    pub fn watermark(&self) -> u64 {
        self.last_delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(id: u64) -> Packet {
        packet_in_epoch(id, 1)
    }

    fn packet_in_epoch(id: u64, epoch: u32) -> Packet {
        Packet {
            sender_id: "node-a".to_string(),
            group_epoch: epoch,
            packet_id: id,
            payload: Bytes::from_static(b"x"),
        }
    }

    fn ids(deliver: &[Packet]) -> Vec<u64> {
        deliver.iter().map(|p| p.packet_id).collect()
    }

    #[test]
    fn contiguous_sequence_delivers_in_order_exactly_once() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);
        let mut delivered = Vec::new();
        for id in 1..=5 {
            let accepted = seq.accept(packet(id));
            assert!(accepted.nack.is_none());
            delivered.extend(ids(&accepted.deliver));
        }
        assert_eq!(delivered, vec![1, 2, 3, 4, 5]);
        assert_eq!(seq.take_ack(), Some(5));
        assert_eq!(seq.take_ack(), None);
    }

    #[test]
    fn duplicate_of_delivered_packet_is_suppressed() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);
        seq.accept(packet(1));
        seq.accept(packet(2));

        let accepted = seq.accept(packet(2));
        assert!(accepted.duplicate);
        assert!(accepted.deliver.is_empty());
        assert_eq!(seq.watermark(), 2);
    }

    #[test]
    fn gap_is_nacked_and_heals_on_resend() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);
        let mut delivered = Vec::new();

        delivered.extend(ids(&seq.accept(packet(1)).deliver));
        delivered.extend(ids(&seq.accept(packet(2)).deliver));

        // 3 is dropped by the network; 4 arrives and must nack exactly [3].
        let accepted = seq.accept(packet(4));
        assert_eq!(accepted.nack, Some(vec![3]));
        assert!(accepted.deliver.is_empty());

        // 5 arrives; the hole is already nacked, no repeat.
        let accepted = seq.accept(packet(5));
        assert!(accepted.nack.is_none());

        // Resent 3 releases 3, 4 and 5 in order.
        let accepted = seq.accept(packet(3));
        delivered.extend(ids(&accepted.deliver));
        assert_eq!(delivered, vec![1, 2, 3, 4, 5]);
        assert_eq!(seq.take_ack(), Some(5));
    }

    #[test]
    fn deep_first_contact_adopts_stream_without_backfill() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);
        let accepted = seq.accept(packet(17));
        assert_eq!(ids(&accepted.deliver), vec![17]);
        assert!(accepted.nack.is_none());
        assert_eq!(seq.watermark(), 17);
    }

    #[test]
    fn shallow_first_contact_nacks_the_missing_prefix() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);

        // Ids start at 1, so a first contact at 3 within the window is a loss of 1 and 2,
        // not a mid-flight join.
        let accepted = seq.accept(packet(3));
        assert!(accepted.deliver.is_empty());
        assert_eq!(accepted.nack, Some(vec![1, 2]));

        let accepted = seq.accept(packet(1));
        assert_eq!(ids(&accepted.deliver), vec![1]);
        let accepted = seq.accept(packet(2));
        assert_eq!(ids(&accepted.deliver), vec![2, 3]);
        assert_eq!(seq.take_ack(), Some(3));
    }

    #[test]
    fn lost_prefix_after_sender_restart_is_nacked_and_recovered() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);
        seq.accept(packet(1));
        seq.accept(packet(2));

        // Sender restarts into epoch 2; its first two packets are dropped and 3 arrives
        // first. The resends must not be mistaken for duplicates.
        let accepted = seq.accept(packet_in_epoch(3, 2));
        assert!(accepted.deliver.is_empty());
        assert_eq!(accepted.nack, Some(vec![1, 2]));

        let accepted = seq.accept(packet_in_epoch(1, 2));
        assert_eq!(ids(&accepted.deliver), vec![1]);
        let accepted = seq.accept(packet_in_epoch(2, 2));
        assert_eq!(ids(&accepted.deliver), vec![2, 3]);
    }

    #[test]
    fn authoritative_first_contact_adopts_without_nacking_prefix() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);

        // A full invalidate supersedes the missing 1 and 2; no backfill wanted.
        let accepted = seq.accept_authoritative(packet(3));
        assert_eq!(ids(&accepted.deliver), vec![3]);
        assert!(accepted.nack.is_none());
        assert_eq!(seq.watermark(), 3);
    }

    #[test]
    fn epoch_change_resets_expectations() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);
        seq.accept(packet(1));
        seq.accept(packet(2));
        // 3 lost, 4 buffered.
        seq.accept(packet(4));

        // Sender restarted into epoch 2 with a fresh id stream. No gap-fill across epochs.
        let accepted = seq.accept(packet_in_epoch(1, 2));
        assert_eq!(ids(&accepted.deliver), vec![1]);
        assert!(accepted.nack.is_none());

        let accepted = seq.accept(packet_in_epoch(2, 2));
        assert_eq!(ids(&accepted.deliver), vec![2]);
    }

    #[test]
    fn authoritative_packet_skips_unhealable_holes() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 8);
        seq.accept(packet(1));
        // 2 lost for good; 3 buffered behind the hole.
        seq.accept(packet(3));

        // A full invalidate at id 4 supersedes whatever 2 carried. 3 was already buffered
        // below it, so adoption at 4 discards it along with the hole.
        let accepted = seq.accept_authoritative(packet(4));
        assert_eq!(ids(&accepted.deliver), vec![4]);
        assert_eq!(seq.watermark(), 4);

        // Normal sequencing resumes after it.
        let accepted = seq.accept(packet(5));
        assert_eq!(ids(&accepted.deliver), vec![5]);

        // And replays of the authoritative packet stay suppressed.
        let accepted = seq.accept_authoritative(packet(4));
        assert!(accepted.duplicate);
    }

    #[test]
    fn reorder_buffer_is_bounded() {
        let mut seq = InboundSequencer::new("node-a".to_string(), 2);
        seq.accept(packet(1));
        // Buffer 3 and 4 (2 lost); the window of 2 is now full.
        seq.accept(packet(3));
        seq.accept(packet(4));

        let accepted = seq.accept(packet(5));
        assert!(accepted.deliver.is_empty());
        assert!(accepted.nack.is_none());

        // The dropped 5 is recovered later by the sender's sweep.
        let accepted = seq.accept(packet(2));
        assert_eq!(ids(&accepted.deliver), vec![2, 3, 4]);
        let accepted = seq.accept(packet(5));
        assert_eq!(ids(&accepted.deliver), vec![5]);
    }
}
