use crate::coordinator::{ClusterCounters, ServerRegistry};
use crate::event::ChangeEvent;
use crate::wire::{Packet, WireError};
use std::sync::Arc;

/// Server-side handler for inbound cluster traffic. Stateless per invocation: decode,
/// route to the addressed local server, done. Shared by both transports.
pub(crate) struct RequestProcessor {
    logger: slog::Logger,
    registry: Arc<ServerRegistry>,
    counters: Arc<ClusterCounters>,
}

impl RequestProcessor {
    pub fn new(logger: slog::Logger, registry: Arc<ServerRegistry>, counters: Arc<ClusterCounters>) -> Self {
        RequestProcessor {
            logger,
            registry,
            counters,
        }
    }

    /// Route one event to its local server. Unroutable events are logged and dropped:
    /// the originating table state here is unaffected, so correctness is preserved.
    pub fn apply(&self, event: &ChangeEvent) {
        match self.registry.route(event.server_name()) {
            Some(handle) => {
                ClusterCounters::incr(&self.counters.events_received);
                handle.invalidate(event);
            }
            None => {
                ClusterCounters::incr(&self.counters.events_dropped);
                slog::warn!(
                    self.logger,
                    "Dropping event for unregistered server '{}'",
                    event.server_name()
                );
            }
        }
    }

    pub fn apply_all(&self, events: &[ChangeEvent]) {
        for event in events {
            self.apply(event);
        }
    }

    /// Decode and apply the batched events in a sequenced packet. A malformed payload is
    /// counted and dropped without retry; retrying cannot fix corrupt bytes, and the
    /// sequencing layer's retransmission handles genuine loss.
    pub fn apply_packet(&self, packet: &Packet) -> Result<usize, WireError> {
        match packet.events() {
            Ok(events) => {
                self.apply_all(&events);
                Ok(events.len())
            }
            Err(e) => {
                ClusterCounters::incr(&self.counters.malformed_payloads);
                slog::warn!(
                    self.logger,
                    "Discarding malformed payload in packet {} from '{}': {}",
                    packet.packet_id,
                    packet.sender_id,
                    e
                );
                Err(e)
            }
        }
    }
}
