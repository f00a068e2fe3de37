use crate::config::TransportKind;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared across the coordinator and transport tasks. Relaxed ordering is
/// enough; these feed the observational snapshot, never control flow.
#[derive(Default)]
pub(crate) struct ClusterCounters {
    pub events_sent: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_resent: AtomicU64,
    pub events_received: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub events_dropped: AtomicU64,
    pub malformed_payloads: AtomicU64,
    pub duplicate_packets: AtomicU64,
}

impl ClusterCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Read-only snapshot for operational monitoring. Created on demand; mutating it affects
/// nothing.
#[derive(Clone, Debug)]
pub struct ClusterStatus {
    pub transport: TransportKind,
    pub events_sent: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_resent: u64,
    pub events_received: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub events_dropped: u64,
    pub malformed_payloads: u64,
    pub duplicate_packets: u64,
    pub group_size: usize,
    pub outgoing_cache_size: usize,
    pub current_packet_id: u64,
    pub min_acked_packet_id: u64,
    pub last_ack_digest: String,
}
